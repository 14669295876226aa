//! Request and response records for the coordinator's RPC surface.
//!
//! Byte streams (source download, result upload) are not modeled here; they
//! ride as raw HTTP bodies with the hash and lease carried in headers and
//! query parameters.

use serde::{Deserialize, Serialize};

use av1_farm_config::ClusterConfig;

use crate::profile::SourceProfile;
use crate::types::{FailureKind, Phase, SkipReason};

/// What a worker announces about itself at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub cpu_count: u32,
    pub memory_total: u64,
    /// Encoder presets this worker's build supports.
    #[serde(default)]
    pub encoder_presets: Vec<u8>,
    /// Worker can pull source bytes and push results over the wire.
    #[serde(default)]
    pub supports_file_distribution: bool,
}

/// `POST /workers/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Stable id chosen by the worker (hostname + salt hash), so a
    /// reconnecting worker lands on its old registry entry.
    pub worker_id: String,
    pub display_name: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: WorkerCapabilities,
}

/// Registration answer: the cluster config the worker must operate under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    pub config_digest: String,
    pub cluster_config: ClusterConfig,
}

/// Progress snapshot of the job a worker is currently running, sent with
/// heartbeats so the registry can show live state even between progress posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJob {
    pub file_id: i64,
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: u64,
    pub phase: Phase,
}

/// `POST /workers/{id}/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentJob>,
}

/// Heartbeat answer. Cancellation rides here rather than on a push channel:
/// the coordinator never needs an inbound connection to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Worker should finish the current job and then stop asking for work.
    pub fade_out: bool,
    /// Lease of the assignment the operator aborted; the worker kills its
    /// encoder and reports `failure(kind=killed)` with this lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<String>,
}

/// Cluster knobs a worker needs to process one assignment. The CRF itself is
/// decided worker-side after the probe; these are the coordinator-owned
/// settings that frame that decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentParams {
    pub encoder_preset: u8,
    pub skip_audio_transcode: bool,
    pub min_savings_pct: f64,
}

/// One unit of authorized work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub file_id: i64,
    /// Canonical path on the coordinator; the worker uses it only for naming.
    pub path: String,
    pub size_bytes: u64,
    /// Blake3 hex of the source bytes, verified by the worker after download.
    pub content_hash: String,
    /// Opaque token tying this assignment to this worker. Every mutating
    /// report must carry it; it changes on every (re)assignment.
    pub lease_token: String,
    pub params: AssignmentParams,
}

/// `POST /workers/{id}/next` answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
    #[serde(default)]
    pub no_work: bool,
}

impl NextResponse {
    pub fn assignment(assignment: Assignment) -> Self {
        Self {
            assignment: Some(assignment),
            no_work: false,
        }
    }

    pub fn no_work() -> Self {
        Self {
            assignment: None,
            no_work: true,
        }
    }
}

/// Settings the worker's quality policy chose for this file, reported after
/// the probe so the coordinator can record them on the file row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettings {
    pub crf: u8,
    pub audio_bitrate_kbps: u32,
}

/// `POST /files/{id}/progress`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub lease_token: String,
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: u64,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Attached to the first `probing` report so the coordinator can record
    /// source metadata and the HDR classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceProfile>,
    /// Attached once the quality policy has decided the encode settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSettings>,
}

/// Terminal outcome of one assignment, as observed by the worker.
///
/// The worker reports facts; the coordinator classifies them into the state
/// transition. In particular a `Failure` does not necessarily park the file:
/// retryability is decided coordinator-side from the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        output_size_bytes: u64,
    },
    Failure {
        kind: FailureKind,
        message: String,
        /// Worker-side hint, consulted only when the kind itself is ambiguous.
        retryable: bool,
    },
    Skip {
        reason: SkipReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `POST /files/{id}/report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub lease_token: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Answer to a result upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub accepted: bool,
    /// Resumable upload id, echoed back so the worker can continue after a
    /// dropped connection with `?upload=<id>&offset=<received>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Bytes received so far (resume offset).
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_report_wire_shape() {
        let report = OutcomeReport {
            lease_token: "lease-1".to_string(),
            outcome: Outcome::Failure {
                kind: FailureKind::EncoderCrash,
                message: "ffmpeg exited with code 1".to_string(),
                retryable: true,
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        // The outcome is flattened: one object with a "result" tag.
        assert_eq!(json["result"], "failure");
        assert_eq!(json["kind"], "encoder_crash");
        assert_eq!(json["lease_token"], "lease-1");

        let back: OutcomeReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_skip_outcome_round_trip() {
        let report = OutcomeReport {
            lease_token: "lease-2".to_string(),
            outcome: Outcome::Skip {
                reason: SkipReason::DynamicHdrUnpreservable,
                message: Some("Dolby Vision profile 5".to_string()),
            },
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"result\":\"skip\""));
        assert!(json.contains("dynamic_hdr_unpreservable"));
        let back: OutcomeReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_next_response_constructors() {
        let none = NextResponse::no_work();
        assert!(none.no_work);
        assert!(none.assignment.is_none());

        let json = serde_json::to_string(&none).unwrap();
        assert_eq!(json, "{\"no_work\":true}");
    }

    #[test]
    fn test_heartbeat_response_omits_empty_cancel() {
        let resp = HeartbeatResponse {
            fade_out: false,
            cancel: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("cancel"));

        let resp = HeartbeatResponse {
            fade_out: true,
            cancel: Some("lease-3".to_string()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"cancel\":\"lease-3\""));
    }
}
