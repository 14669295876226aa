//! AV1 farm worker
//!
//! Pulls one assignment at a time from the coordinator, downloads the source,
//! probes it, decides encoding parameters, runs the encoder, and streams the
//! result back. The worker never touches shared storage: its writes stay in
//! the local temp directory, and every mutation it reports carries the lease
//! the coordinator issued with the assignment.

pub mod client;
pub mod probe;
pub mod quality;
pub mod runner;
pub mod startup;
pub mod transcode;

pub use client::{ClientError, CoordinatorClient};
pub use probe::{probe_file, ProbeError};
pub use quality::{decide, PolicyDecision};
pub use runner::WorkerRunner;
pub use transcode::{build_ffmpeg_command, run_encoder, TranscodeError, TranscodeOutput};
