//! Work dispatch: one entry point, invoked when a worker asks for its next
//! file.
//!
//! The scheduler owns no state of its own. Eligibility comes from the
//! registry (known? fading out? already busy?), candidate selection and the
//! atomic claim come from the store, and the only slow step, hashing the
//! source bytes, runs after the claim so the store lock is never held across
//! IO.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use av1_farm_config::ClusterConfig;
use av1_farm_protocol::{Assignment, AssignmentParams, FailureKind, NextResponse};

use crate::events::{Event, EventBus};
use crate::registry::WorkerRegistry;
use crate::store::{now_ms, LeaseCheck, Store, StoreError};

/// How many times a dispatch retries after losing a claim race or hitting an
/// unreadable file before giving up with `no_work`.
const CLAIM_RETRY_BOUND: usize = 3;

/// Error type for dispatch operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The hashing task panicked.
    #[error("hash task failed: {0}")]
    HashTask(#[from] tokio::task::JoinError),
}

pub struct Scheduler {
    store: Arc<Store>,
    registry: Arc<WorkerRegistry>,
    events: Arc<EventBus>,
    cluster: ClusterConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            cluster,
        }
    }

    /// Pick, claim and hand out the next file for `worker_id`.
    ///
    /// Answers `no_work` when the worker is unknown, fading out, already
    /// holding an assignment, lacks the file-distribution capability, when
    /// dispatch is paused, or when the queue has nothing eligible.
    pub async fn next_for(&self, worker_id: &str) -> Result<NextResponse, SchedulerError> {
        let Some(worker) = self.registry.worker(worker_id) else {
            return Ok(NextResponse::no_work());
        };
        if worker.fade_out {
            return Ok(NextResponse::no_work());
        }
        if !worker.capabilities.supports_file_distribution {
            // The coordinator only serves bytes over the wire; a worker that
            // cannot pull them has nothing it can be given.
            return Ok(NextResponse::no_work());
        }
        if self.store.assignment_for_worker(worker_id)?.is_some() {
            return Ok(NextResponse::no_work());
        }
        if self.store.is_paused()? {
            return Ok(NextResponse::no_work());
        }

        let pin_grace_ms = self.cluster.pin_grace_s as i64 * 1000;

        for _ in 0..CLAIM_RETRY_BOUND {
            let claimed = self.store.claim_next(
                worker_id,
                self.cluster.file_order,
                pin_grace_ms,
                now_ms(),
            )?;
            let Some(record) = claimed else {
                return Ok(NextResponse::no_work());
            };
            let lease = record
                .lease_token
                .clone()
                .expect("claimed record always carries a lease");

            // Hash the source now so the worker can verify the download end
            // to end. This is the one expensive step; it happens outside any
            // lock, and a vanished file turns into a retryable failure.
            let path = std::path::PathBuf::from(&record.path);
            let hash = tokio::task::spawn_blocking(move || hash_file(&path)).await?;

            let hash = match hash {
                Ok(hash) => hash,
                Err(err) => {
                    warn!(
                        file_id = record.id,
                        path = %record.path,
                        error = %err,
                        "source unreadable at claim time, requeueing"
                    );
                    self.store.record_failure(
                        record.id,
                        &lease,
                        FailureKind::IoError.as_str(),
                        &format!("source unreadable at claim: {err}"),
                        true,
                        self.cluster.max_attempts,
                        now_ms(),
                    )?;
                    continue;
                }
            };

            if self.store.set_content_hash(record.id, &lease, &hash)? == LeaseCheck::Stale {
                // The assignment was reaped while we were hashing; the file
                // is back in the queue for someone else.
                continue;
            }

            self.registry.note_assignment(worker_id, record.id);
            let record = self
                .store
                .file(record.id)?
                .ok_or(StoreError::NotFound(record.id))?;
            self.events.publish(Event::state_changed(&record));
            info!(
                file_id = record.id,
                path = %record.path,
                worker_id,
                attempt = record.attempt_count,
                "assigned file to worker"
            );

            return Ok(NextResponse::assignment(Assignment {
                file_id: record.id,
                path: record.path,
                size_bytes: record.size_bytes,
                content_hash: hash,
                lease_token: lease,
                params: AssignmentParams {
                    encoder_preset: self.cluster.encoder_preset,
                    skip_audio_transcode: self.cluster.skip_audio_transcode,
                    min_savings_pct: self.cluster.min_savings_pct,
                },
            }));
        }

        Ok(NextResponse::no_work())
    }
}

/// Blake3 hex digest of a file's contents.
pub fn hash_file(path: &std::path::Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
