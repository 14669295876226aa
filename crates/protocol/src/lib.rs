//! Wire types for the AV1 farm
//!
//! Everything the coordinator and workers exchange over the RPC surface:
//! file and worker state enums, the probed source profile, encoding
//! parameters, and the request/response records themselves. The coordinator
//! owns all state transitions; these types only carry the facts.

pub mod messages;
pub mod params;
pub mod profile;
pub mod types;

pub use messages::{
    Assignment, AssignmentParams, CurrentJob, HeartbeatRequest, HeartbeatResponse, NextResponse,
    Outcome, OutcomeReport, ProgressReport, RegisterRequest, RegisterResponse, TargetSettings,
    UploadResponse, WorkerCapabilities,
};
pub use params::{ColorParams, EncodeParams};
pub use profile::{
    audio_bitrate_bucket, bitrate_bucket, channel_bucket, AudioTrack, ResolutionBucket,
    SourceProfile,
};
pub use types::{FailureKind, FileStatus, HdrKind, Phase, SkipReason, WorkerStatus};
