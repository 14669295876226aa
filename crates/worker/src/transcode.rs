//! Encoder subprocess wrapper.
//!
//! Builds the ffmpeg command line (SVT-AV1 video, Opus audio, subtitles and
//! metadata carried over), runs it at the lowest scheduling priority, parses
//! the `-progress` key=value stream at one update per second, and enforces
//! cancellation: SIGTERM first, SIGKILL after the grace period, and no
//! partial output left behind in any exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use av1_farm_protocol::EncodeParams;

/// Grace period between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Minimum interval between progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Error type for encoding operations.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Encoder exited non-zero or died on a signal.
    #[error("encoder failed with exit code {exit_code:?}")]
    EncoderCrash { exit_code: Option<i32> },

    /// Cancelled on request; the partial output was removed.
    #[error("encode was cancelled")]
    Killed,

    /// Encoder exited cleanly but the output is missing or empty.
    #[error("encoder produced no output")]
    EmptyOutput,

    /// IO error talking to the subprocess or the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutput {
    pub output_path: PathBuf,
    pub output_size: u64,
}

/// One progress tick parsed from the encoder's progress stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeProgress {
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: u64,
}

/// Build the ffmpeg command for one encode.
///
/// The subprocess runs under `nice -n 19 ionice -c 3` so a farm machine
/// stays usable while it encodes. All streams are mapped: video to SVT-AV1,
/// audio to Opus per stream (or stream-copied when the cluster says so),
/// subtitles and container metadata copied through.
pub fn build_ffmpeg_command(
    input: &Path,
    output: &Path,
    params: &EncodeParams,
) -> std::process::Command {
    let mut cmd = std::process::Command::new("nice");
    cmd.args(["-n", "19", "ionice", "-c", "3", "ffmpeg"]);

    cmd.arg("-i").arg(input);
    cmd.args(["-map", "0"]);

    cmd.args(["-c:v", "libsvtav1"]);
    cmd.arg("-preset").arg(params.preset.to_string());
    cmd.arg("-crf").arg(params.crf.to_string());
    cmd.arg("-pix_fmt").arg(&params.pixel_format);

    if let Some(color) = &params.color {
        cmd.arg("-color_primaries").arg(&color.color_primaries);
        cmd.arg("-color_trc").arg(&color.color_transfer);
        cmd.arg("-colorspace").arg(&color.color_space);
        cmd.args(["-svtav1-params", "enable-hdr=1"]);
    }

    if params.skip_audio_transcode {
        cmd.args(["-c:a", "copy"]);
    } else {
        cmd.args(["-c:a", "libopus"]);
        for (index, kbps) in params.audio_bitrates_kbps.iter().enumerate() {
            cmd.arg(format!("-b:a:{index}")).arg(format!("{kbps}k"));
        }
    }

    cmd.args(["-c:s", "copy"]);
    cmd.args(["-map_metadata", "0"]);
    cmd.args(["-progress", "pipe:2", "-nostats"]);
    cmd.arg("-y").arg(output);

    cmd
}

/// Parses ffmpeg `-progress` key=value blocks into progress ticks.
///
/// A block ends with a `progress=continue`/`progress=end` line; ticks are
/// emitted at block boundaries, rate-limited to one per second.
pub struct ProgressParser {
    total_frames: u64,
    min_interval: Duration,
    last_emit: Option<Instant>,
    frame: u64,
    fps: f64,
}

impl ProgressParser {
    pub fn new(total_frames: u64) -> Self {
        Self::with_min_interval(total_frames, PROGRESS_INTERVAL)
    }

    pub fn with_min_interval(total_frames: u64, min_interval: Duration) -> Self {
        Self {
            total_frames,
            min_interval,
            last_emit: None,
            frame: 0,
            fps: 0.0,
        }
    }

    /// Feed one stderr line; returns a tick when a block boundary passes the
    /// rate limit.
    pub fn push_line(&mut self, line: &str) -> Option<TranscodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "frame" => {
                self.frame = value.trim().parse().unwrap_or(self.frame);
                None
            }
            "fps" => {
                self.fps = value.trim().parse().unwrap_or(self.fps);
                None
            }
            "progress" => {
                let finishing = value.trim() == "end";
                let now = Instant::now();
                if !finishing {
                    if let Some(last) = self.last_emit {
                        if now.duration_since(last) < self.min_interval {
                            return None;
                        }
                    }
                }
                self.last_emit = Some(now);
                Some(self.tick())
            }
            _ => None,
        }
    }

    fn tick(&self) -> TranscodeProgress {
        let percent = if self.total_frames > 0 {
            (self.frame as f64 / self.total_frames as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let eta_seconds = if self.fps > 0.0 && self.total_frames > self.frame {
            ((self.total_frames - self.frame) as f64 / self.fps).round() as u64
        } else {
            0
        };
        TranscodeProgress {
            percent,
            fps: self.fps,
            eta_seconds,
        }
    }
}

/// Ask the subprocess to stop the way the OS guarantees delivery: SIGTERM.
/// Escalation to SIGKILL happens at the grace deadline.
#[cfg(unix)]
fn send_sigterm(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // Signalling a pid we spawned and have not yet reaped; a failure
        // just means the process already exited.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &tokio::process::Child) {
    // No graceful signal available; the grace deadline hard-kills instead.
}

/// Run a prepared encoder command to completion.
///
/// `cancel` triggers the stop sequence: SIGTERM to the encoder, then a hard
/// kill once `grace` expires. Whatever the exit path, a failed or cancelled
/// run leaves no partial output file behind.
pub async fn run_encoder(
    cmd: std::process::Command,
    output_path: &Path,
    total_frames: u64,
    cancel: &CancellationToken,
    grace: Duration,
    mut on_progress: impl FnMut(TranscodeProgress),
) -> Result<TranscodeOutput, TranscodeError> {
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("encoder stderr not captured"))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut parser = ProgressParser::new(total_frames);

    let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
    let mut kill_at = far_future;
    let mut cancelled = false;

    // Drain progress until the encoder closes stderr, reacting to the
    // cancellation token and the kill deadline as they fire.
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(tick) = parser.push_line(&line) {
                        on_progress(tick);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                // SIGTERM first; ffmpeg catches it and shuts down cleanly.
                send_sigterm(&child);
                kill_at = Instant::now() + grace;
            },
            _ = tokio::time::sleep_until(kill_at), if cancelled => {
                // Stop draining: a grandchild may keep the stderr pipe open
                // long after the encoder itself is gone.
                let _ = child.start_kill();
                kill_at = far_future;
                break;
            },
        }
    }

    // Stderr is closed; if we are cancelling, do not wait longer than the
    // remaining grace before the hard kill.
    let status = if cancelled {
        match tokio::time::timeout_at(kill_at, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await?
            }
        }
    } else {
        child.wait().await?
    };

    if cancelled {
        remove_partial(output_path);
        return Err(TranscodeError::Killed);
    }

    if !status.success() {
        remove_partial(output_path);
        return Err(TranscodeError::EncoderCrash {
            exit_code: status.code(),
        });
    }

    let output_size = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);
    if output_size == 0 {
        remove_partial(output_path);
        return Err(TranscodeError::EmptyOutput);
    }

    Ok(TranscodeOutput {
        output_path: output_path.to_path_buf(),
        output_size,
    })
}

fn remove_partial(output_path: &Path) {
    if output_path.exists() {
        let _ = std::fs::remove_file(output_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av1_farm_protocol::ColorParams;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use tempfile::TempDir;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn params() -> EncodeParams {
        EncodeParams {
            crf: 26,
            preset: 8,
            audio_bitrates_kbps: vec![160, 96],
            pixel_format: "yuv420p".to_string(),
            color: None,
            skip_audio_transcode: false,
        }
    }

    #[test]
    fn test_command_runs_under_nice_and_ionice() {
        let cmd = build_ffmpeg_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &params());
        assert_eq!(cmd.get_program(), OsStr::new("nice"));
        let args = get_command_args(&cmd);
        assert_eq!(&args[..6], &["-n", "19", "ionice", "-c", "3", "ffmpeg"]);
    }

    #[test]
    fn test_command_maps_audio_per_stream() {
        let cmd = build_ffmpeg_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &params());
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-c:a", "libopus"));
        assert!(has_flag_with_value(&args, "-b:a:0", "160k"));
        assert!(has_flag_with_value(&args, "-b:a:1", "96k"));
    }

    #[test]
    fn test_command_stream_copies_audio_when_asked() {
        let mut p = params();
        p.skip_audio_transcode = true;
        let cmd = build_ffmpeg_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &p);
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-c:a", "copy"));
        assert!(!args.iter().any(|a| a.starts_with("-b:a:")));
    }

    #[test]
    fn test_command_hdr10_color_signalling() {
        let mut p = params();
        p.pixel_format = "yuv420p10le".to_string();
        p.color = Some(ColorParams::hdr10(None, None));
        let cmd = build_ffmpeg_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &p);
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-color_primaries", "bt2020"));
        assert!(has_flag_with_value(&args, "-color_trc", "smpte2084"));
        assert!(has_flag_with_value(&args, "-colorspace", "bt2020nc"));
        assert!(has_flag_with_value(&args, "-svtav1-params", "enable-hdr=1"));
        assert!(has_flag_with_value(&args, "-pix_fmt", "yuv420p10le"));
    }

    // For any valid encode parameters, the built command carries every
    // required argument.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            crf in 16u8..40,
            preset in 0u8..13,
            audio_count in 0usize..4,
            input in "[a-zA-Z0-9_/.-]{1,40}",
            output in "[a-zA-Z0-9_/.-]{1,40}",
        ) {
            let p = EncodeParams {
                crf,
                preset,
                audio_bitrates_kbps: vec![128; audio_count],
                pixel_format: "yuv420p".to_string(),
                color: None,
                skip_audio_transcode: false,
            };
            let cmd = build_ffmpeg_command(Path::new(&input), Path::new(&output), &p);
            let args = get_command_args(&cmd);

            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert!(has_flag_with_value(&args, "-map", "0"));
            prop_assert!(has_flag_with_value(&args, "-c:v", "libsvtav1"));
            prop_assert!(has_flag_with_value(&args, "-preset", &preset.to_string()));
            prop_assert!(has_flag_with_value(&args, "-crf", &crf.to_string()));
            prop_assert!(has_flag_with_value(&args, "-c:s", "copy"));
            prop_assert!(has_flag_with_value(&args, "-map_metadata", "0"));
            prop_assert!(has_flag_with_value(&args, "-progress", "pipe:2"));
            prop_assert!(args.iter().any(|a| a == "-y"));
            prop_assert_eq!(args.last().map(String::as_str), Some(output.as_str()));
            for i in 0..audio_count {
                let flag = format!("-b:a:{}", i);
                prop_assert!(has_flag_with_value(&args, &flag, "128k"));
            }
        }
    }

    #[test]
    fn test_progress_parser_emits_on_block_boundary() {
        let mut parser = ProgressParser::with_min_interval(1000, Duration::ZERO);
        assert!(parser.push_line("frame=250").is_none());
        assert!(parser.push_line("fps=25.0").is_none());
        assert!(parser.push_line("out_time_us=10000000").is_none());

        let tick = parser.push_line("progress=continue").unwrap();
        assert!((tick.percent - 25.0).abs() < 0.001);
        assert!((tick.fps - 25.0).abs() < 0.001);
        assert_eq!(tick.eta_seconds, 30); // 750 frames left at 25 fps
    }

    #[test]
    fn test_progress_parser_rate_limits_but_always_emits_end() {
        let mut parser = ProgressParser::with_min_interval(100, Duration::from_secs(3600));
        parser.push_line("frame=10");
        assert!(parser.push_line("progress=continue").is_some());
        parser.push_line("frame=20");
        // Within the interval: suppressed.
        assert!(parser.push_line("progress=continue").is_none());
        parser.push_line("frame=100");
        // The final block always comes through.
        let tick = parser.push_line("progress=end").unwrap();
        assert!((tick.percent - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_progress_parser_ignores_noise() {
        let mut parser = ProgressParser::with_min_interval(100, Duration::ZERO);
        assert!(parser.push_line("").is_none());
        assert!(parser.push_line("random stderr chatter").is_none());
        assert!(parser.push_line("bitrate=1200.1kbits/s").is_none());
    }

    fn sh(script: &str) -> std::process::Command {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_encoder_success_with_progress() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mkv");
        let script = format!(
            "echo 'frame=50' >&2; echo 'fps=10' >&2; echo 'progress=continue' >&2; \
             printf data > {}; echo 'frame=100' >&2; echo 'progress=end' >&2",
            output.display()
        );

        let cancel = CancellationToken::new();
        let mut ticks = Vec::new();
        let result = run_encoder(
            sh(&script),
            &output,
            100,
            &cancel,
            Duration::from_millis(100),
            |tick| ticks.push(tick),
        )
        .await
        .unwrap();

        assert_eq!(result.output_size, 4);
        assert!(!ticks.is_empty());
        assert!((ticks.last().unwrap().percent - 100.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_run_encoder_nonzero_exit_removes_partial() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mkv");
        let script = format!("printf partial > {}; exit 3", output.display());

        let cancel = CancellationToken::new();
        let err = run_encoder(
            sh(&script),
            &output,
            100,
            &cancel,
            Duration::from_millis(100),
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            TranscodeError::EncoderCrash { exit_code: Some(3) }
        ));
        assert!(!output.exists(), "partial output must be removed");
    }

    #[tokio::test]
    async fn test_run_encoder_empty_output_is_an_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mkv");
        let script = format!("touch {}", output.display());

        let cancel = CancellationToken::new();
        let err = run_encoder(
            sh(&script),
            &output,
            100,
            &cancel,
            Duration::from_millis(100),
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TranscodeError::EmptyOutput));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_run_encoder_cancellation_kills_and_cleans() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mkv");
        // The shell dies on SIGTERM, but its `sleep` grandchild keeps the
        // stderr pipe open, so the grace deadline still has to fire to
        // break the drain loop.
        let script = format!("printf partial > {}; sleep 30", output.display());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let err = run_encoder(
            sh(&script),
            &output,
            100,
            &cancel,
            Duration::from_millis(100),
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TranscodeError::Killed));
        assert!(!output.exists(), "partial output must be removed");
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "hard kill should preempt the 30s sleep"
        );
    }
}
