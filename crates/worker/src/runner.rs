//! The worker's main loop.
//!
//! One job at a time: request an assignment, pull the source, probe it,
//! decide the encode, run the encoder, verify, and stream the result back.
//! Heartbeats run on their own task and carry back the coordinator's
//! directives (fade-out, cancel-current). The worker never decides a file's
//! fate; it reports what happened and lets the coordinator classify.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::System;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use av1_farm_config::WorkerConfig;
use av1_farm_protocol::{
    Assignment, CurrentJob, FailureKind, HeartbeatRequest, Outcome, OutcomeReport, Phase,
    ProgressReport, RegisterRequest, SkipReason, SourceProfile, TargetSettings,
    WorkerCapabilities,
};

use crate::client::{hash_file, ClientError, CoordinatorClient};
use crate::probe::{probe_file, ProbeError};
use crate::quality::{decide, PolicyDecision, PolicyInputs};
use crate::startup::{run_startup_checks, StartupError};
use crate::transcode::{build_ffmpeg_command, run_encoder, TranscodeError, TranscodeProgress, STOP_GRACE};

/// Error type for the worker run loop.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// System hostname, from the environment the way init scripts leave it.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Stable worker id: the coordinator keys registry entries on it, so it must
/// survive worker restarts but stay distinct across hosts.
pub fn worker_id_for(hostname: &str) -> String {
    let digest = blake3::hash(format!("av1-farm-worker:{hostname}").as_bytes());
    format!("worker-{}", &digest.to_hex()[..12])
}

/// Shared between the run loop and the heartbeat task.
#[derive(Default)]
struct RunnerState {
    fade_out: bool,
    current: Option<CurrentJob>,
    active_lease: Option<String>,
    cancel: Option<CancellationToken>,
}

pub struct WorkerRunner {
    config: WorkerConfig,
    client: Arc<CoordinatorClient>,
    state: Arc<Mutex<RunnerState>>,
}

impl WorkerRunner {
    pub fn new(config: WorkerConfig) -> Result<Self, RunnerError> {
        let host = hostname();
        let worker_id = worker_id_for(&host);
        let client = Arc::new(CoordinatorClient::new(&config.coordinator_url, &worker_id)?);
        Ok(Self {
            config,
            client,
            state: Arc::new(Mutex::new(RunnerState::default())),
        })
    }

    fn register_request(&self) -> RegisterRequest {
        let host = hostname();
        let sys = System::new_all();
        RegisterRequest {
            worker_id: self.client.worker_id().to_string(),
            display_name: self
                .config
                .display_name
                .clone()
                .unwrap_or_else(|| host.clone()),
            hostname: host,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: WorkerCapabilities {
                cpu_count: sys.cpus().len() as u32,
                memory_total: sys.total_memory(),
                encoder_presets: vec![4, 6, 8, 10, 12],
                supports_file_distribution: true,
            },
        }
    }

    /// Run until the process is killed.
    pub async fn run(&self) -> Result<(), RunnerError> {
        run_startup_checks().await?;
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| ClientError::Io(e))?;
        clean_temp_dir(&self.config.temp_dir).await;

        let register = self.register_request();
        loop {
            match self.client.register(&register).await {
                Ok(resp) => {
                    info!(
                        worker_id = self.client.worker_id(),
                        config_digest = resp.config_digest.as_str(),
                        "registered with coordinator"
                    );
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "registration failed, retrying");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }

        tokio::spawn(heartbeat_loop(
            self.client.clone(),
            self.state.clone(),
            register,
            Duration::from_secs(self.config.heartbeat_interval_s.max(1)),
        ));

        info!("worker started, waiting for jobs");
        loop {
            let fading = self.state.lock().expect("runner state poisoned").fade_out;
            if !fading {
                match self.client.next().await {
                    Ok(resp) => {
                        if let Some(assignment) = resp.assignment {
                            self.process(assignment).await;
                            continue;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to request work"),
                }
            }
            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_s.max(1))).await;
        }
    }

    /// Process one assignment end to end and report its outcome.
    async fn process(&self, assignment: Assignment) {
        let file_id = assignment.file_id;
        let lease = assignment.lease_token.clone();
        info!(file_id, path = assignment.path.as_str(), "processing assignment");

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            state.active_lease = Some(lease.clone());
            state.cancel = Some(cancel.clone());
            state.current = Some(CurrentJob {
                file_id,
                percent: 0.0,
                fps: 0.0,
                eta_seconds: 0,
                phase: Phase::Downloading,
            });
        }

        let input = self
            .config
            .temp_dir
            .join(format!("{file_id}_{}", file_stem(&assignment.path)));
        let output = self.config.temp_dir.join(format!("{file_id}_av1.mkv"));

        let outcome = self.run_job(&assignment, &input, &output, &cancel).await;

        if let Some(outcome) = outcome {
            let report = OutcomeReport {
                lease_token: lease,
                outcome,
            };
            if let Err(err) = self.client.report_outcome(file_id, &report).await {
                warn!(file_id, error = %err, "failed to deliver outcome report");
            }
        }

        let _ = tokio::fs::remove_file(&input).await;
        let _ = tokio::fs::remove_file(&output).await;
        let mut state = self.state.lock().expect("runner state poisoned");
        state.active_lease = None;
        state.cancel = None;
        state.current = None;
    }

    /// The job pipeline. Returns the outcome to report, or `None` when the
    /// assignment died under us (stale lease) or the coordinator already
    /// recorded the terminal state through the upload verdict.
    async fn run_job(
        &self,
        assignment: &Assignment,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        let file_id = assignment.file_id;

        // Phase 1: pull the source.
        self.progress(file_id, assignment, Phase::Downloading, 0.0, None, None)
            .await;
        match self.client.download(assignment, input).await {
            Ok(()) => {}
            Err(ClientError::StaleLease) => {
                warn!(file_id, "assignment reaped during download");
                return None;
            }
            Err(err) => {
                return Some(Outcome::Failure {
                    kind: FailureKind::TransferError,
                    message: format!("download failed: {err}"),
                    retryable: true,
                });
            }
        }
        if cancel.is_cancelled() {
            return Some(killed_outcome());
        }

        // Phase 2: probe.
        self.progress(file_id, assignment, Phase::Probing, 0.0, None, None)
            .await;
        let profile = match probe_file(input).await {
            Ok(profile) => profile,
            Err(err) => return Some(probe_outcome(&err)),
        };

        // Phase 3: decide. The source metadata goes back with this report so
        // the coordinator records codec and HDR classification either way.
        let params = match decide(
            &profile,
            &PolicyInputs {
                encoder_preset: assignment.params.encoder_preset,
                skip_audio_transcode: assignment.params.skip_audio_transcode,
            },
        ) {
            PolicyDecision::Skip(reason) => {
                self.progress(
                    file_id,
                    assignment,
                    Phase::Probing,
                    100.0,
                    Some(profile.clone()),
                    None,
                )
                .await;
                info!(file_id, reason = %reason, "skipping per quality policy");
                return Some(Outcome::Skip {
                    reason,
                    message: Some(skip_message(reason, &profile)),
                });
            }
            PolicyDecision::Encode(params) => {
                let target = TargetSettings {
                    crf: params.crf,
                    audio_bitrate_kbps: params.audio_bitrates_kbps.first().copied().unwrap_or(0),
                };
                self.progress(
                    file_id,
                    assignment,
                    Phase::Probing,
                    100.0,
                    Some(profile.clone()),
                    Some(target),
                )
                .await;
                params
            }
        };

        // Phase 4: encode, forwarding progress ticks as they arrive.
        let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel::<TranscodeProgress>();
        let forwarder = {
            let client = self.client.clone();
            let state = self.state.clone();
            let lease = assignment.lease_token.clone();
            tokio::spawn(async move {
                while let Some(tick) = tick_rx.recv().await {
                    {
                        let mut state = state.lock().expect("runner state poisoned");
                        if let Some(current) = &mut state.current {
                            current.percent = tick.percent;
                            current.fps = tick.fps;
                            current.eta_seconds = tick.eta_seconds;
                            current.phase = Phase::Transcoding;
                        }
                    }
                    let report = ProgressReport {
                        lease_token: lease.clone(),
                        percent: tick.percent,
                        fps: tick.fps,
                        eta_seconds: tick.eta_seconds,
                        phase: Phase::Transcoding,
                        message: None,
                        source: None,
                        target: None,
                    };
                    if let Err(err) = client.report_progress(file_id, &report).await {
                        warn!(file_id, error = %err, "progress report failed");
                    }
                }
            })
        };

        let cmd = build_ffmpeg_command(input, output, &params);
        let encode_result = run_encoder(
            cmd,
            output,
            profile.total_frames,
            cancel,
            STOP_GRACE,
            move |tick| {
                let _ = tick_tx.send(tick);
            },
        )
        .await;
        let _ = forwarder.await;

        let encoded = match encode_result {
            Ok(encoded) => encoded,
            Err(err) => return Some(transcode_outcome(&err)),
        };

        // Phase 5: verify our own output before shipping it.
        self.progress(file_id, assignment, Phase::Verifying, 0.0, None, None)
            .await;
        if let Err(err) = probe_file(output).await {
            return Some(Outcome::Failure {
                kind: FailureKind::EmptyOutput,
                message: format!("output failed verification: {err}"),
                retryable: true,
            });
        }

        // Phase 6: upload. The coordinator verifies, swaps and records; its
        // verdict is authoritative.
        self.progress(file_id, assignment, Phase::Uploading, 0.0, None, None)
            .await;
        let output_hash = {
            let path = output.to_path_buf();
            match tokio::task::spawn_blocking(move || hash_file(&path)).await {
                Ok(Ok(hash)) => hash,
                other => {
                    return Some(Outcome::Failure {
                        kind: FailureKind::IoError,
                        message: format!("failed to hash output: {other:?}"),
                        retryable: true,
                    });
                }
            }
        };

        let verdict = match self
            .client
            .upload(
                file_id,
                &assignment.lease_token,
                output,
                encoded.output_size,
                &output_hash,
            )
            .await
        {
            Ok(verdict) => verdict,
            Err(ClientError::StaleLease) => {
                warn!(file_id, "assignment reaped during upload");
                return None;
            }
            Err(err) => {
                return Some(Outcome::Failure {
                    kind: FailureKind::TransferError,
                    message: format!("upload failed: {err}"),
                    retryable: true,
                });
            }
        };

        if verdict.accepted {
            info!(
                file_id,
                savings_percent = verdict.savings_percent.unwrap_or(0.0),
                "job complete"
            );
            return Some(Outcome::Success {
                output_size_bytes: encoded.output_size,
            });
        }
        match verdict.reason.as_deref() {
            Some("output_smaller_than_threshold") => {
                // The coordinator already recorded the terminal skip.
                info!(file_id, "upload rejected below the savings floor");
                None
            }
            reason => Some(Outcome::Failure {
                kind: FailureKind::TransferError,
                message: format!("upload rejected: {}", reason.unwrap_or("unknown")),
                retryable: true,
            }),
        }
    }

    /// Send a phase progress report and mirror it into the heartbeat state.
    async fn progress(
        &self,
        file_id: i64,
        assignment: &Assignment,
        phase: Phase,
        percent: f64,
        source: Option<SourceProfile>,
        target: Option<TargetSettings>,
    ) {
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if let Some(current) = &mut state.current {
                current.phase = phase;
                current.percent = percent;
            }
        }
        let report = ProgressReport {
            lease_token: assignment.lease_token.clone(),
            percent,
            fps: 0.0,
            eta_seconds: 0,
            phase,
            message: None,
            source,
            target,
        };
        if let Err(err) = self.client.report_progress(file_id, &report).await {
            warn!(file_id, error = %err, "progress report failed");
        }
    }
}

/// Heartbeat task: telemetry out, directives in.
async fn heartbeat_loop(
    client: Arc<CoordinatorClient>,
    state: Arc<Mutex<RunnerState>>,
    register: RegisterRequest,
    interval: Duration,
) {
    let mut sys = System::new_all();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_info().cpu_usage();
        let memory_percent = if sys.total_memory() > 0 {
            sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
        } else {
            0.0
        };

        let current = state
            .lock()
            .expect("runner state poisoned")
            .current
            .clone();
        let req = HeartbeatRequest {
            cpu_percent,
            memory_percent,
            current,
        };

        match client.heartbeat(&req).await {
            Ok(Some(resp)) => {
                let mut state = state.lock().expect("runner state poisoned");
                state.fade_out = resp.fade_out;
                if let Some(cancel_lease) = resp.cancel {
                    if state.active_lease.as_deref() == Some(cancel_lease.as_str()) {
                        info!("cancel directive received, stopping encoder");
                        if let Some(token) = &state.cancel {
                            token.cancel();
                        }
                    }
                }
            }
            Ok(None) => {
                // The coordinator restarted and lost the registry.
                warn!("coordinator does not know us, re-registering");
                if let Err(err) = client.register(&register).await {
                    warn!(error = %err, "re-registration failed");
                }
            }
            Err(err) => warn!(error = %err, "heartbeat failed"),
        }
    }
}

/// Map a probe failure onto the outcome the coordinator should classify.
fn probe_outcome(err: &ProbeError) -> Outcome {
    match err {
        ProbeError::Timeout => Outcome::Failure {
            kind: FailureKind::ProbeTimeout,
            message: err.to_string(),
            retryable: true,
        },
        ProbeError::Unreadable(_) => Outcome::Failure {
            kind: FailureKind::IoError,
            message: err.to_string(),
            retryable: true,
        },
        ProbeError::Malformed(_) => Outcome::Failure {
            kind: FailureKind::MalformedSource,
            message: err.to_string(),
            retryable: false,
        },
        ProbeError::NoVideoStream => Outcome::Skip {
            reason: SkipReason::NonVideo,
            message: Some("no video stream found".to_string()),
        },
    }
}

/// Map an encoder failure onto the outcome the coordinator should classify.
fn transcode_outcome(err: &TranscodeError) -> Outcome {
    match err {
        TranscodeError::Killed => killed_outcome(),
        TranscodeError::EncoderCrash { exit_code } => Outcome::Failure {
            kind: FailureKind::EncoderCrash,
            message: format!("encoder exited with code {exit_code:?}"),
            retryable: true,
        },
        TranscodeError::EmptyOutput => Outcome::Failure {
            kind: FailureKind::EmptyOutput,
            message: "encoder produced no output".to_string(),
            retryable: true,
        },
        TranscodeError::Io(io) => {
            let disk_full = io.raw_os_error() == Some(28); // ENOSPC
            Outcome::Failure {
                kind: if disk_full {
                    FailureKind::DiskFull
                } else {
                    FailureKind::IoError
                },
                message: io.to_string(),
                retryable: !disk_full,
            }
        }
    }
}

fn killed_outcome() -> Outcome {
    Outcome::Failure {
        kind: FailureKind::Killed,
        message: "encoder stopped on cancel directive".to_string(),
        retryable: true,
    }
}

fn skip_message(reason: SkipReason, profile: &SourceProfile) -> String {
    match reason {
        SkipReason::DynamicHdrUnpreservable => match profile.dolby_vision_profile {
            Some(p) => format!("Dolby Vision profile {p} cannot be preserved"),
            None => "HDR10+ dynamic metadata cannot be preserved".to_string(),
        },
        SkipReason::AlreadyEfficient => format!(
            "already AV1 at {} kb/s, re-encode would not pay off",
            profile.bitrate / 1000
        ),
        other => other.to_string(),
    }
}

/// Last path component of the assignment path, for local temp naming.
fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "input.mkv".to_string())
}

/// Remove leftovers from a previous run of this worker.
async fn clean_temp_dir(dir: &PathBuf) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let mut removed = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
            && tokio::fs::remove_file(entry.path()).await.is_ok()
        {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "cleaned stale temp files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_is_stable_and_distinct() {
        let a = worker_id_for("encoder-01");
        let b = worker_id_for("encoder-01");
        let c = worker_id_for("encoder-02");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("worker-"));
        assert_eq!(a.len(), "worker-".len() + 12);
    }

    #[test]
    fn test_probe_errors_map_to_coordinator_kinds() {
        assert!(matches!(
            probe_outcome(&ProbeError::Timeout),
            Outcome::Failure {
                kind: FailureKind::ProbeTimeout,
                retryable: true,
                ..
            }
        ));
        assert!(matches!(
            probe_outcome(&ProbeError::Malformed("x".to_string())),
            Outcome::Failure {
                kind: FailureKind::MalformedSource,
                retryable: false,
                ..
            }
        ));
        assert!(matches!(
            probe_outcome(&ProbeError::NoVideoStream),
            Outcome::Skip {
                reason: SkipReason::NonVideo,
                ..
            }
        ));
    }

    #[test]
    fn test_transcode_errors_map_to_coordinator_kinds() {
        assert!(matches!(
            transcode_outcome(&TranscodeError::Killed),
            Outcome::Failure {
                kind: FailureKind::Killed,
                ..
            }
        ));
        assert!(matches!(
            transcode_outcome(&TranscodeError::EncoderCrash { exit_code: Some(1) }),
            Outcome::Failure {
                kind: FailureKind::EncoderCrash,
                ..
            }
        ));
        assert!(matches!(
            transcode_outcome(&TranscodeError::EmptyOutput),
            Outcome::Failure {
                kind: FailureKind::EmptyOutput,
                ..
            }
        ));

        let enospc = std::io::Error::from_raw_os_error(28);
        assert!(matches!(
            transcode_outcome(&TranscodeError::Io(enospc)),
            Outcome::Failure {
                kind: FailureKind::DiskFull,
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn test_file_stem_extraction() {
        assert_eq!(file_stem("/media/movies/film.mkv"), "film.mkv");
        assert_eq!(file_stem("film.mkv"), "film.mkv");
        assert_eq!(file_stem(""), "input.mkv");
    }

    #[test]
    fn test_skip_messages_are_specific() {
        let mut profile = SourceProfile {
            container: "matroska".to_string(),
            video_codec: "hevc".to_string(),
            width: 3840,
            height: 2160,
            bit_depth: 10,
            frame_rate: 24.0,
            bitrate: 25_000_000,
            duration_secs: 60.0,
            total_frames: 1440,
            color_transfer: None,
            color_primaries: None,
            color_space: None,
            mastering_display: None,
            content_light_level: None,
            dolby_vision_profile: Some(5),
            hdr10plus_present: false,
            audio: vec![],
        };
        assert_eq!(
            skip_message(SkipReason::DynamicHdrUnpreservable, &profile),
            "Dolby Vision profile 5 cannot be preserved"
        );

        profile.dolby_vision_profile = None;
        assert!(
            skip_message(SkipReason::DynamicHdrUnpreservable, &profile).contains("HDR10+")
        );
    }
}
