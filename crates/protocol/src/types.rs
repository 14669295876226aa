//! State and classification enums shared across the farm.

use serde::{Deserialize, Serialize};

/// Queue state of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// File is waiting in the queue.
    Pending,
    /// File has been handed to a worker but no progress arrived yet.
    Assigned,
    /// A worker is actively working on the file.
    Processing,
    /// File was transcoded and swapped in successfully.
    Completed,
    /// File failed and needs operator attention.
    Failed,
    /// File was deliberately not transcoded (terminal, not an error).
    Skipped,
}

impl Default for FileStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl FileStatus {
    /// True for states with a live assignment.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FileStatus::Assigned | FileStatus::Processing)
    }

    /// True when no further work will happen without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Assigned => "assigned",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }

    /// Parse the lowercase form stored in the database.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "assigned" => Some(FileStatus::Assigned),
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            "failed" => Some(FileStatus::Failed),
            "skipped" => Some(FileStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HDR classification of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrKind {
    /// SDR or no HDR signalling found.
    None,
    /// Static HDR10 metadata; preservable through an AV1 encode.
    Hdr10,
    /// HDR10+ dynamic metadata; not preservable, file is skipped.
    Hdr10Plus,
    /// Dolby Vision; not preservable, file is skipped.
    DolbyVision,
    /// Probe could not classify the HDR signalling.
    Unknown,
}

impl Default for HdrKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl HdrKind {
    /// Dynamic-metadata HDR cannot survive the encode and forces a skip.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, HdrKind::Hdr10Plus | HdrKind::DolbyVision)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HdrKind::None => "none",
            HdrKind::Hdr10 => "hdr10",
            HdrKind::Hdr10Plus => "hdr10plus",
            HdrKind::DolbyVision => "dolby_vision",
            HdrKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(HdrKind::None),
            "hdr10" => Some(HdrKind::Hdr10),
            "hdr10plus" => Some(HdrKind::Hdr10Plus),
            "dolby_vision" => Some(HdrKind::DolbyVision),
            "unknown" => Some(HdrKind::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for HdrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-reported phase of the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Downloading,
    Probing,
    Transcoding,
    Uploading,
    Verifying,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Downloading => "downloading",
            Phase::Probing => "probing",
            Phase::Transcoding => "transcoding",
            Phase::Uploading => "uploading",
            Phase::Verifying => "verifying",
        };
        f.write_str(s)
    }
}

/// Terminal skip reasons. A skip is a decision, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// HDR10+ / Dolby Vision dynamic metadata would be lost by the encode.
    DynamicHdrUnpreservable,
    /// Source is already AV1 at a bitrate the target settings would not beat.
    AlreadyEfficient,
    /// Probe found no video stream.
    NonVideo,
    /// The encode finished but did not clear the savings floor.
    OutputSmallerThanThreshold,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DynamicHdrUnpreservable => "dynamic_hdr_unpreservable",
            SkipReason::AlreadyEfficient => "already_efficient",
            SkipReason::NonVideo => "non_video",
            SkipReason::OutputSmallerThanThreshold => "output_smaller_than_threshold",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure kinds the lifecycle understands.
///
/// The worker reports what happened; the coordinator decides the state
/// transition from the kind, never from worker-side judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Download or upload failed mid-stream (includes hash mismatch).
    TransferError,
    /// The media inspector did not answer in time.
    ProbeTimeout,
    /// The encoder subprocess died or exited non-zero.
    EncoderCrash,
    /// The encoder exited cleanly but produced no usable output.
    EmptyOutput,
    /// The worker stopped heartbeating while holding the assignment.
    WorkerOffline,
    /// A report arrived with a lease that is no longer current.
    StaleLease,
    /// A processing job went silent past the progress timeout.
    Stalled,
    /// The encoder was killed on an operator cancel directive.
    Killed,
    /// Local disk or file IO error on the worker.
    IoError,
    /// The inspector could read the file but the contents are broken.
    MalformedSource,
    /// No space left for the temp copy or the upload staging file.
    DiskFull,
    /// The atomic swap failed or could not be rolled back cleanly.
    SafeReplaceFailed,
}

impl FailureKind {
    /// Whether this kind sends the file back to `pending` (attempt budget
    /// permitting) rather than parking it as `failed`.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::TransferError
            | FailureKind::ProbeTimeout
            | FailureKind::EncoderCrash
            | FailureKind::EmptyOutput
            | FailureKind::WorkerOffline
            | FailureKind::StaleLease
            | FailureKind::Stalled
            | FailureKind::Killed
            | FailureKind::IoError => true,
            FailureKind::MalformedSource
            | FailureKind::DiskFull
            | FailureKind::SafeReplaceFailed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransferError => "transfer_error",
            FailureKind::ProbeTimeout => "probe_timeout",
            FailureKind::EncoderCrash => "encoder_crash",
            FailureKind::EmptyOutput => "empty_output",
            FailureKind::WorkerOffline => "worker_offline",
            FailureKind::StaleLease => "stale_lease",
            FailureKind::Stalled => "stalled",
            FailureKind::Killed => "killed",
            FailureKind::IoError => "io_error",
            FailureKind::MalformedSource => "malformed_source",
            FailureKind::DiskFull => "disk_full",
            FailureKind::SafeReplaceFailed => "safe_replace_failed",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Registering,
    Idle,
    Processing,
    Offline,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::Registering
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Registering => "registering",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_status_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Assigned,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Failed,
            FileStatus::Skipped,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn test_file_status_classification() {
        assert!(FileStatus::Assigned.is_in_flight());
        assert!(FileStatus::Processing.is_in_flight());
        assert!(!FileStatus::Pending.is_in_flight());
        assert!(!FileStatus::Completed.is_in_flight());

        assert!(FileStatus::Completed.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
        assert!(FileStatus::Skipped.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
        assert!(!FileStatus::Assigned.is_terminal());
    }

    #[test]
    fn test_hdr_kind_dynamic() {
        assert!(HdrKind::Hdr10Plus.is_dynamic());
        assert!(HdrKind::DolbyVision.is_dynamic());
        assert!(!HdrKind::Hdr10.is_dynamic());
        assert!(!HdrKind::None.is_dynamic());
        assert!(!HdrKind::Unknown.is_dynamic());
    }

    #[test]
    fn test_failure_kind_retryability() {
        assert!(FailureKind::TransferError.is_retryable());
        assert!(FailureKind::ProbeTimeout.is_retryable());
        assert!(FailureKind::EncoderCrash.is_retryable());
        assert!(FailureKind::WorkerOffline.is_retryable());
        assert!(FailureKind::StaleLease.is_retryable());
        assert!(FailureKind::Stalled.is_retryable());
        assert!(FailureKind::Killed.is_retryable());

        assert!(!FailureKind::MalformedSource.is_retryable());
        assert!(!FailureKind::DiskFull.is_retryable());
        assert!(!FailureKind::SafeReplaceFailed.is_retryable());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&SkipReason::DynamicHdrUnpreservable).unwrap(),
            "\"dynamic_hdr_unpreservable\""
        );
        assert_eq!(
            serde_json::to_string(&FailureKind::SafeReplaceFailed).unwrap(),
            "\"safe_replace_failed\""
        );
        assert_eq!(
            serde_json::to_string(&HdrKind::DolbyVision).unwrap(),
            "\"dolby_vision\""
        );
    }
}
