//! Core configuration structures and loading logic.
//!
//! Three layers: `ClusterConfig` is the cluster-wide policy distributed to
//! workers (and digested so they can detect drift), `CoordinatorConfig` and
//! `WorkerConfig` are the per-process settings. Files are TOML; a handful of
//! deployment knobs can be overridden through `AV1_FARM_*` environment
//! variables, which wins over the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but is not valid config TOML.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Environment override, with empty values treated as unset.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Boolean environment override. Unrecognized values count as unset so a
/// typo never silently flips a safety flag like `testing_mode`.
fn env_flag(key: &str) -> Option<bool> {
    env_var(key).as_deref().and_then(parse_flag)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Queue ordering applied when a worker asks for its next file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrder {
    /// Oldest modification time first.
    OldestMtime,
    /// Newest modification time first.
    NewestMtime,
    /// Largest file first.
    LargestSize,
    /// Smallest file first.
    SmallestSize,
}

impl Default for FileOrder {
    fn default() -> Self {
        Self::OldestMtime
    }
}

/// Cluster-wide settings distributed to every worker at registration.
///
/// The coordinator hands these out together with a digest so workers can
/// detect when the cluster config changed underneath them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Minimum size reduction (percent) required to accept an encode.
    #[serde(default = "default_min_savings_pct")]
    pub min_savings_pct: f64,
    /// SVT-AV1 preset handed to the encoder.
    #[serde(default = "default_encoder_preset")]
    pub encoder_preset: u8,
    /// Stream-copy audio instead of transcoding to Opus.
    #[serde(default)]
    pub skip_audio_transcode: bool,
    /// Queue ordering for `claim_next`.
    #[serde(default)]
    pub file_order: FileOrder,
    /// Attempts before a file parks as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds without a heartbeat before a worker is declared offline.
    #[serde(default = "default_liveness_timeout_s")]
    pub liveness_timeout_s: u64,
    /// Seconds a preferred-worker pin holds before any worker may claim the file.
    #[serde(default = "default_pin_grace_s")]
    pub pin_grace_s: u64,
    /// Keep `.bak` backups after a successful replace.
    #[serde(default = "default_testing_mode")]
    pub testing_mode: bool,
}

fn default_min_savings_pct() -> f64 {
    5.0
}

fn default_encoder_preset() -> u8 {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_liveness_timeout_s() -> u64 {
    30
}

fn default_pin_grace_s() -> u64 {
    60
}

fn default_testing_mode() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_savings_pct: default_min_savings_pct(),
            encoder_preset: default_encoder_preset(),
            skip_audio_transcode: false,
            file_order: FileOrder::default(),
            max_attempts: default_max_attempts(),
            liveness_timeout_s: default_liveness_timeout_s(),
            pin_grace_s: default_pin_grace_s(),
            testing_mode: default_testing_mode(),
        }
    }
}

impl ClusterConfig {
    /// Digest of the canonical JSON encoding, used by workers to detect drift.
    pub fn digest(&self) -> String {
        let canonical =
            serde_json::to_vec(self).expect("cluster config serialization cannot fail");
        blake3::hash(&canonical).to_hex().to_string()
    }
}

/// Coordinator process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Listen address for the RPC surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Path of the sqlite queue database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Media library roots scanned for candidates.
    #[serde(default)]
    pub library_roots: Vec<PathBuf>,
    /// Seconds between automatic library rescans (0 disables).
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,
    /// Seconds between stall-sweeper passes.
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
    /// Seconds of progress silence before a processing job is force-failed.
    #[serde(default = "default_progress_silence_timeout_s")]
    pub progress_silence_timeout_s: u64,
    /// Cluster-wide settings, distributed to workers.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("transcoding.db")
}

fn default_scan_interval_s() -> u64 {
    3600
}

fn default_sweep_interval_s() -> u64 {
    10
}

fn default_progress_silence_timeout_s() -> u64 {
    300
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            library_roots: Vec::new(),
            scan_interval_s: default_scan_interval_s(),
            sweep_interval_s: default_sweep_interval_s(),
            progress_silence_timeout_s: default_progress_silence_timeout_s(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse from a TOML string. Missing fields take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Fold environment overrides into this config:
    /// `AV1_FARM_BIND_ADDR`, `AV1_FARM_DB_PATH`, `AV1_FARM_TESTING_MODE`.
    pub fn apply_env(&mut self) {
        if let Some(addr) = env_var("AV1_FARM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = env_var("AV1_FARM_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(testing) = env_flag("AV1_FARM_TESTING_MODE") {
            self.cluster.testing_mode = testing;
        }
    }

    /// Load from a TOML file and fold in environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_toml(&read_config_file(path.as_ref())?)?;
        config.apply_env();
        Ok(config)
    }
}

/// Worker process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the coordinator, e.g. `http://192.168.1.100:8090`.
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,
    /// Human-readable name shown in the coordinator's worker list.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Scratch directory for downloads and encoder output.
    #[serde(default = "default_worker_temp_dir")]
    pub temp_dir: PathBuf,
    /// Seconds between heartbeats.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    /// Seconds to wait before asking again after `no_work`.
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_worker_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/av1-farm-worker")
}

fn default_heartbeat_interval_s() -> u64 {
    10
}

fn default_poll_interval_s() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: default_coordinator_url(),
            display_name: None,
            temp_dir: default_worker_temp_dir(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            poll_interval_s: default_poll_interval_s(),
        }
    }
}

impl WorkerConfig {
    /// Parse from a TOML string. Missing fields take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Fold environment overrides into this config:
    /// `AV1_FARM_COORDINATOR_URL`, `AV1_FARM_TEMP_DIR`.
    pub fn apply_env(&mut self) {
        if let Some(url) = env_var("AV1_FARM_COORDINATOR_URL") {
            self.coordinator_url = url;
        }
        if let Some(dir) = env_var("AV1_FARM_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }
    }

    /// Load from a TOML file and fold in environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_toml(&read_config_file(path.as_ref())?)?;
        config.apply_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let coordinator = CoordinatorConfig::from_toml("").unwrap();
        assert_eq!(coordinator, CoordinatorConfig::default());
        assert_eq!(coordinator.bind_addr, "0.0.0.0:8090");
        assert_eq!(coordinator.db_path, PathBuf::from("transcoding.db"));
        assert_eq!(coordinator.progress_silence_timeout_s, 300);

        let cluster = &coordinator.cluster;
        assert!((cluster.min_savings_pct - 5.0).abs() < 0.0001);
        assert_eq!(cluster.encoder_preset, 8);
        assert_eq!(cluster.max_attempts, 3);
        assert_eq!(cluster.liveness_timeout_s, 30);
        assert_eq!(cluster.pin_grace_s, 60);
        assert_eq!(cluster.file_order, FileOrder::OldestMtime);
        assert!(cluster.testing_mode);

        let worker = WorkerConfig::from_toml("").unwrap();
        assert_eq!(worker, WorkerConfig::default());
        assert_eq!(worker.heartbeat_interval_s, 10);
        assert_eq!(worker.poll_interval_s, 5);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = CoordinatorConfig::from_toml(
            r#"
bind_addr = "127.0.0.1:9000"
library_roots = ["/media/movies", "/media/tv"]

[cluster]
min_savings_pct = 10.0
file_order = "largest_size"
"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.library_roots.len(), 2);
        assert!((config.cluster.min_savings_pct - 10.0).abs() < 0.0001);
        assert_eq!(config.cluster.file_order, FileOrder::LargestSize);
        // Untouched fields stay at their defaults.
        assert_eq!(config.cluster.encoder_preset, 8);
        assert!(config.cluster.testing_mode);
        assert_eq!(config.sweep_interval_s, 10);
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        let err = CoordinatorConfig::from_toml("bind_addr = [not toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_a_read_error_naming_the_path() {
        let err = WorkerConfig::load("/no/such/dir/worker.toml").unwrap_err();
        match err {
            ConfigError::Read { path, .. } => {
                assert_eq!(path, PathBuf::from("/no/such/dir/worker.toml"));
            }
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_reads_file_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("coordinator.toml");
        fs::write(
            &path,
            r#"
bind_addr = "0.0.0.0:8091"

[cluster]
encoder_preset = 6
"#,
        )
        .unwrap();

        let config = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8091");
        assert_eq!(config.cluster.encoder_preset, 6);
    }

    #[test]
    fn test_flag_parsing_rejects_garbage() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("No"), Some(false));
        // Garbage never flips a flag.
        assert_eq!(parse_flag("enabled"), None);
        assert_eq!(parse_flag(""), None);
    }

    // The only test that touches the process environment; kept singular so
    // parallel test threads cannot race on the global env.
    #[test]
    fn test_env_overrides_win_over_file_values() {
        let vars = [
            "AV1_FARM_BIND_ADDR",
            "AV1_FARM_DB_PATH",
            "AV1_FARM_TESTING_MODE",
            "AV1_FARM_COORDINATOR_URL",
            "AV1_FARM_TEMP_DIR",
        ];
        for var in vars {
            std::env::remove_var(var);
        }

        std::env::set_var("AV1_FARM_BIND_ADDR", "10.0.0.5:9999");
        std::env::set_var("AV1_FARM_DB_PATH", "/data/queue.db");
        std::env::set_var("AV1_FARM_TESTING_MODE", "no");
        std::env::set_var("AV1_FARM_COORDINATOR_URL", "http://head-node:8090");
        // Empty values count as unset.
        std::env::set_var("AV1_FARM_TEMP_DIR", "");

        let mut coordinator = CoordinatorConfig::from_toml(
            r#"
bind_addr = "127.0.0.1:8090"

[cluster]
testing_mode = true
"#,
        )
        .unwrap();
        coordinator.apply_env();
        assert_eq!(coordinator.bind_addr, "10.0.0.5:9999");
        assert_eq!(coordinator.db_path, PathBuf::from("/data/queue.db"));
        assert!(!coordinator.cluster.testing_mode);

        let mut worker = WorkerConfig::default();
        let default_temp = worker.temp_dir.clone();
        worker.apply_env();
        assert_eq!(worker.coordinator_url, "http://head-node:8090");
        assert_eq!(worker.temp_dir, default_temp);

        // An unparseable flag leaves the file value alone.
        std::env::set_var("AV1_FARM_TESTING_MODE", "maybe");
        let mut coordinator = CoordinatorConfig::default();
        coordinator.apply_env();
        assert!(coordinator.cluster.testing_mode);

        for var in vars {
            std::env::remove_var(var);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Any cluster config survives a TOML round trip unchanged, so the
        // file format can express every policy the coordinator can hold.
        #[test]
        fn prop_cluster_config_toml_round_trip(
            min_savings in 0u32..5000,
            preset in 0u8..13,
            skip_audio in proptest::bool::ANY,
            max_attempts in 1u32..10,
            liveness in 5u64..300,
            pin_grace in 0u64..600,
            testing in proptest::bool::ANY,
            order in prop_oneof![
                Just(FileOrder::OldestMtime),
                Just(FileOrder::NewestMtime),
                Just(FileOrder::LargestSize),
                Just(FileOrder::SmallestSize),
            ],
        ) {
            let cluster = ClusterConfig {
                // Percentages in hundredths keep the float exactly
                // representable through the text round trip.
                min_savings_pct: min_savings as f64 / 100.0,
                encoder_preset: preset,
                skip_audio_transcode: skip_audio,
                file_order: order,
                max_attempts,
                liveness_timeout_s: liveness,
                pin_grace_s: pin_grace,
                testing_mode: testing,
            };
            let text = toml::to_string(&cluster).expect("cluster config serializes");
            let parsed: ClusterConfig = toml::from_str(&text).expect("round trip parses");
            prop_assert_eq!(parsed, cluster);
        }

        // Two configs with identical contents digest identically; changing a
        // field changes the digest.
        #[test]
        fn prop_cluster_digest_tracks_contents(
            preset in 0u8..12,
            testing in proptest::bool::ANY,
        ) {
            let a = ClusterConfig { encoder_preset: preset, testing_mode: testing, ..Default::default() };
            let b = ClusterConfig { encoder_preset: preset, testing_mode: testing, ..Default::default() };
            prop_assert_eq!(a.digest(), b.digest());

            let c = ClusterConfig { encoder_preset: preset + 1, testing_mode: testing, ..Default::default() };
            prop_assert_ne!(a.digest(), c.digest());
        }
    }
}
