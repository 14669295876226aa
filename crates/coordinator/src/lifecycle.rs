//! The orchestrator that walks each file from `assigned` to a terminal state.
//!
//! Workers report facts (progress, outcomes); this module turns them into
//! state transitions. It is the only writer of worker-originated mutations,
//! and every one of them is lease-gated by the store, so a reaped or
//! re-assigned job cannot be mutated by its previous owner. Stale reports are
//! logged for the audit trail and otherwise dropped.

use std::sync::Arc;

use tracing::{info, warn};

use av1_farm_config::ClusterConfig;
use av1_farm_protocol::{FailureKind, Outcome, OutcomeReport, ProgressReport};

use crate::events::{Event, EventBus};
use crate::registry::WorkerRegistry;
use crate::safe_replace::ReplaceReport;
use crate::store::{CompletionResult, FailureResult, LeaseCheck, Store, StoreError};

pub struct JobLifecycle {
    store: Arc<Store>,
    registry: Arc<WorkerRegistry>,
    events: Arc<EventBus>,
    cluster: ClusterConfig,
    progress_silence_timeout_s: u64,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
        cluster: ClusterConfig,
        progress_silence_timeout_s: u64,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            cluster,
            progress_silence_timeout_s,
        }
    }

    /// Apply a progress report. The first report moves the file to
    /// `processing`; source metadata rides along on the probing report.
    pub fn handle_progress(
        &self,
        file_id: i64,
        report: &ProgressReport,
        now: i64,
    ) -> Result<LeaseCheck, StoreError> {
        let check = self.store.record_progress(
            file_id,
            &report.lease_token,
            report.percent,
            report.fps,
            report.eta_seconds,
            now,
        )?;
        if check == LeaseCheck::Stale {
            // Belongs to a reaped assignment; drop it silently apart from
            // the audit trail.
            warn!(file_id, phase = %report.phase, "dropping progress report with stale lease");
            return Ok(LeaseCheck::Stale);
        }

        if let Some(source) = &report.source {
            self.store
                .record_source_metadata(file_id, &report.lease_token, source, report.target, now)?;
        }

        if let Some(record) = self.store.file(file_id)? {
            if let Some(worker_id) = &record.assigned_worker_id {
                self.registry
                    .note_progress(worker_id, report.percent, report.fps, report.eta_seconds);
                self.events.publish_progress(
                    file_id,
                    worker_id,
                    report.percent,
                    report.fps,
                    report.eta_seconds,
                    report.phase,
                );
            }
        }
        Ok(LeaseCheck::Applied)
    }

    /// Classify and apply a terminal outcome report from a worker.
    pub fn handle_report(
        &self,
        file_id: i64,
        report: &OutcomeReport,
        now: i64,
    ) -> Result<(), StoreError> {
        let record = self.store.file(file_id)?.ok_or(StoreError::NotFound(file_id))?;
        let worker_id = record.assigned_worker_id.clone();
        let lease = &report.lease_token;

        match &report.outcome {
            Outcome::Success { output_size_bytes } => {
                // Completion is committed by the upload path (after
                // SafeReplace). A success report is an acknowledgment; for a
                // record that never committed it would claim a replacement
                // that did not happen, so it is never trusted on its own.
                match self.store.record_completion(file_id, lease, *output_size_bytes, now)? {
                    CompletionResult::AlreadyCompleted => {
                        info!(file_id, "duplicate completion report, no-op");
                    }
                    CompletionResult::Stale => {
                        warn!(file_id, "stale_lease: dropping completion report");
                    }
                    CompletionResult::Completed { .. } => {
                        // Reaching completion through a bare report means the
                        // upload commit never ran; roll the record back so an
                        // unreplaced file cannot read as done.
                        warn!(
                            file_id,
                            "success report without a committed upload; resetting to pending"
                        );
                        self.store.reset_file(file_id, now)?;
                        if let Some(worker_id) = &worker_id {
                            self.registry.note_job_finished(worker_id, false);
                        }
                    }
                }
            }
            Outcome::Failure {
                kind,
                message,
                retryable,
            } => {
                // The kind decides; the worker's hint only matters for kinds
                // where both paths are plausible, which today is none.
                let _ = retryable;
                let result = self.store.record_failure(
                    file_id,
                    lease,
                    kind.as_str(),
                    message,
                    kind.is_retryable(),
                    self.cluster.max_attempts,
                    now,
                )?;
                match result {
                    FailureResult::Stale => {
                        warn!(file_id, kind = %kind, "stale_lease: dropping failure report");
                        return Ok(());
                    }
                    FailureResult::Requeued { attempt_count } => {
                        info!(file_id, kind = %kind, attempt_count, error = %message, "job failed, requeued");
                    }
                    FailureResult::Parked => {
                        warn!(file_id, kind = %kind, error = %message, "job failed permanently");
                    }
                }
                if let Some(worker_id) = &worker_id {
                    self.registry.note_job_finished(worker_id, false);
                }
                self.publish_state(file_id)?;
            }
            Outcome::Skip { reason, message } => {
                let check = self.store.record_skip(
                    file_id,
                    Some(lease),
                    reason.as_str(),
                    message.as_deref().unwrap_or(reason.as_str()),
                    now,
                )?;
                if check == LeaseCheck::Stale {
                    warn!(file_id, reason = %reason, "stale_lease: dropping skip report");
                    return Ok(());
                }
                info!(file_id, reason = %reason, "file skipped");
                if let Some(worker_id) = &worker_id {
                    // A skip is a decision, not a fault.
                    self.registry.note_job_finished(worker_id, true);
                }
                self.publish_state(file_id)?;
            }
        }
        Ok(())
    }

    /// Commit a verified upload: the swap already happened, record it.
    pub fn commit_upload(
        &self,
        file_id: i64,
        lease: &str,
        report: &ReplaceReport,
        now: i64,
    ) -> Result<CompletionResult, StoreError> {
        let record = self.store.file(file_id)?.ok_or(StoreError::NotFound(file_id))?;
        let result = self
            .store
            .record_completion(file_id, lease, report.output_size, now)?;
        if let CompletionResult::Completed {
            savings_percent, ..
        } = result
        {
            info!(
                file_id,
                output_size = report.output_size,
                savings_percent,
                "file completed"
            );
            if let Some(worker_id) = &record.assigned_worker_id {
                self.registry.note_job_finished(worker_id, true);
            }
            self.events.clear_progress_gate(file_id);
            self.publish_state(file_id)?;
        }
        Ok(result)
    }

    /// The encode finished but did not clear the savings floor: terminal
    /// skip, the original stays untouched.
    pub fn reject_insufficient_savings(
        &self,
        file_id: i64,
        lease: &str,
        original_size: u64,
        output_size: u64,
        now: i64,
    ) -> Result<LeaseCheck, StoreError> {
        let record = self.store.file(file_id)?.ok_or(StoreError::NotFound(file_id))?;
        let message = format!(
            "output {output_size} of {original_size} bytes misses the \
             {:.1}% savings floor",
            self.cluster.min_savings_pct
        );
        let check = self.store.record_skip(
            file_id,
            Some(lease),
            "output_smaller_than_threshold",
            &message,
            now,
        )?;
        if check == LeaseCheck::Applied {
            warn!(file_id, detail = message.as_str(), "upload rejected, file skipped");
            if let Some(worker_id) = &record.assigned_worker_id {
                self.registry.note_job_finished(worker_id, true);
            }
            self.events.clear_progress_gate(file_id);
            self.publish_state(file_id)?;
        }
        Ok(check)
    }

    /// The swap itself failed after a verified upload. Operator territory.
    pub fn fail_replace(
        &self,
        file_id: i64,
        lease: &str,
        message: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let record = self.store.file(file_id)?.ok_or(StoreError::NotFound(file_id))?;
        let result = self.store.record_failure(
            file_id,
            lease,
            FailureKind::SafeReplaceFailed.as_str(),
            message,
            false,
            self.cluster.max_attempts,
            now,
        )?;
        if result != FailureResult::Stale {
            if let Some(worker_id) = &record.assigned_worker_id {
                self.registry.note_job_finished(worker_id, false);
            }
            self.publish_state(file_id)?;
        }
        Ok(())
    }

    /// Operator abort: queue a cancel directive for the worker holding this
    /// file. Delivered with its next heartbeat; if the worker never answers,
    /// the sweeper reaps the assignment instead.
    pub fn request_cancel(&self, file_id: i64) -> Result<bool, StoreError> {
        let record = self.store.file(file_id)?.ok_or(StoreError::NotFound(file_id))?;
        if !record.status.is_in_flight() {
            return Ok(false);
        }
        match (&record.assigned_worker_id, &record.lease_token) {
            (Some(worker_id), Some(lease)) => {
                self.registry.request_cancel(worker_id, lease);
                info!(file_id, worker_id = worker_id.as_str(), "cancel directive queued");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// One stall-sweeper pass.
    ///
    /// - Workers silent past the liveness timeout go offline and their
    ///   assignments return to pending.
    /// - In-flight records whose worker the registry does not know (for
    ///   example after a coordinator restart) are reaped once they have been
    ///   silent for the liveness timeout.
    /// - Processing records with no progress for the silence timeout are
    ///   force-failed as stalled.
    pub fn sweep(&self, now: i64) -> Result<(), StoreError> {
        let liveness_ms = self.cluster.liveness_timeout_s as i64 * 1000;

        for offline in self.registry.sweep_offline(liveness_ms, now) {
            warn!(worker_id = offline.worker_id.as_str(), "worker offline");
            self.events.publish(Event::WorkerOffline {
                worker_id: offline.worker_id.clone(),
            });
            if let Some(record) = self.store.assignment_for_worker(&offline.worker_id)? {
                if self.store.reap_assignment(record.id, now)? {
                    warn!(
                        file_id = record.id,
                        worker_id = offline.worker_id.as_str(),
                        "reaped assignment of offline worker"
                    );
                    self.publish_state(record.id)?;
                }
            }
        }

        // Orphans: assignments whose worker the registry has never seen.
        // Give their workers one liveness window to re-register and keep
        // reporting before pulling the work back.
        for record in self.store.in_flight()? {
            let Some(worker_id) = &record.assigned_worker_id else {
                continue;
            };
            if self.registry.is_known(worker_id) {
                continue;
            }
            let last_seen = record
                .last_progress_at
                .or(record.assigned_at)
                .unwrap_or(record.updated_at);
            if now - last_seen > liveness_ms && self.store.reap_assignment(record.id, now)? {
                warn!(
                    file_id = record.id,
                    worker_id = worker_id.as_str(),
                    "reaped orphaned assignment"
                );
                self.publish_state(record.id)?;
            }
        }

        // Progress silence: the worker heartbeats but its job went quiet.
        let silence_ms = self.progress_silence_timeout_s as i64 * 1000;
        let cutoff = now - silence_ms;
        for record in self.store.stalled_files(cutoff)? {
            let Some(lease) = &record.lease_token else {
                continue;
            };
            let result = self.store.record_failure(
                record.id,
                lease,
                FailureKind::Stalled.as_str(),
                "no progress within the silence timeout",
                true,
                self.cluster.max_attempts,
                now,
            )?;
            if result != FailureResult::Stale {
                warn!(file_id = record.id, "force-failed stalled job");
                if let Some(worker_id) = &record.assigned_worker_id {
                    self.registry.note_job_finished(worker_id, false);
                }
                self.publish_state(record.id)?;
            }
        }

        Ok(())
    }

    fn publish_state(&self, file_id: i64) -> Result<(), StoreError> {
        if let Some(record) = self.store.file(file_id)? {
            self.events.publish(Event::state_changed(&record));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av1_farm_config::FileOrder;
    use av1_farm_protocol::{
        FileStatus, HeartbeatRequest, Phase, RegisterRequest, SkipReason, WorkerCapabilities,
    };
    use std::path::Path;

    struct Fixture {
        lifecycle: JobLifecycle,
        store: Arc<Store>,
        registry: Arc<WorkerRegistry>,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(WorkerRegistry::new());
        let events = Arc::new(EventBus::default());
        let lifecycle = JobLifecycle::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            ClusterConfig::default(),
            300,
        );
        Fixture {
            lifecycle,
            store,
            registry,
            events,
        }
    }

    fn register(fx: &Fixture, worker_id: &str, now: i64) {
        fx.registry.register(
            &RegisterRequest {
                worker_id: worker_id.to_string(),
                display_name: worker_id.to_string(),
                hostname: "host".to_string(),
                version: "0.1.0".to_string(),
                capabilities: WorkerCapabilities {
                    cpu_count: 8,
                    memory_total: 32 << 30,
                    encoder_presets: vec![8],
                    supports_file_distribution: true,
                },
            },
            now,
        );
    }

    /// Seed one pending file and claim it for `worker_id`. Returns (id, lease).
    fn claimed_file(fx: &Fixture, worker_id: &str, now: i64) -> (i64, String) {
        fx.store
            .upsert_scan(Path::new("/m/a.mkv"), 2_000_000_000, 50, now)
            .unwrap();
        let record = fx
            .store
            .claim_next(worker_id, FileOrder::OldestMtime, 0, now)
            .unwrap()
            .unwrap();
        fx.registry.note_assignment(worker_id, record.id);
        (record.id, record.lease_token.unwrap())
    }

    fn progress(lease: &str, percent: f64) -> ProgressReport {
        ProgressReport {
            lease_token: lease.to_string(),
            percent,
            fps: 24.0,
            eta_seconds: 600,
            phase: Phase::Transcoding,
            message: None,
            source: None,
            target: None,
        }
    }

    #[test]
    fn test_worker_crash_reap_and_reassign() {
        // Worker dies mid-encode, the sweeper reaps after the liveness
        // timeout, a second worker finishes the file under a fresh lease,
        // and the first worker's late report bounces.
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, old_lease) = claimed_file(&fx, "w1", 1_000);
        fx.lifecycle
            .handle_progress(id, &progress(&old_lease, 30.0), 5_000)
            .unwrap();

        // 31 seconds after w1's registration heartbeat, the sweeper fires.
        fx.lifecycle.sweep(32_000).unwrap();

        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(record.attempt_count, 1);
        assert!(record.assigned_worker_id.is_none());

        // W2 picks it up with a new lease and completes.
        register(&fx, "w2", 33_000);
        let record = fx
            .store
            .claim_next("w2", FileOrder::OldestMtime, 0, 34_000)
            .unwrap()
            .unwrap();
        let new_lease = record.lease_token.clone().unwrap();
        assert_ne!(new_lease, old_lease);
        assert_eq!(record.attempt_count, 2);

        let report = ReplaceReport {
            original_size: 2_000_000_000,
            output_size: 900_000_000,
            savings_bytes: 1_100_000_000,
            savings_percent: 55.0,
            backup_kept: true,
        };
        let result = fx
            .lifecycle
            .commit_upload(id, &new_lease, &report, 40_000)
            .unwrap();
        assert!(matches!(result, CompletionResult::Completed { .. }));

        // The revived w1 posts a completion with the dead lease: no-op.
        let stale = fx
            .store
            .record_completion(id, &old_lease, 900_000_000, 50_000)
            .unwrap();
        assert_eq!(stale, CompletionResult::AlreadyCompleted);
        assert_eq!(
            fx.store.file(id).unwrap().unwrap().status,
            FileStatus::Completed
        );
    }

    #[test]
    fn test_stale_progress_is_dropped() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, _lease) = claimed_file(&fx, "w1", 1_000);

        let check = fx
            .lifecycle
            .handle_progress(id, &progress("dead-lease", 55.0), 2_000)
            .unwrap();
        assert_eq!(check, LeaseCheck::Stale);
        assert_eq!(fx.store.file(id).unwrap().unwrap().progress_percent, 0.0);
    }

    #[test]
    fn test_skip_report_is_terminal_and_counts_clean() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);

        let report = OutcomeReport {
            lease_token: lease,
            outcome: Outcome::Skip {
                reason: SkipReason::DynamicHdrUnpreservable,
                message: Some("Dolby Vision profile 5".to_string()),
            },
        };
        fx.lifecycle.handle_report(id, &report, 2_000).unwrap();

        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Skipped);
        assert_eq!(
            record.last_error_kind.as_deref(),
            Some("dynamic_hdr_unpreservable")
        );

        let worker = fx.registry.worker("w1").unwrap();
        assert_eq!(worker.jobs_failed, 0);
        assert_eq!(worker.jobs_completed, 1);
    }

    #[test]
    fn test_retryable_failure_requeues_with_event() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);
        let mut rx = fx.events.subscribe();

        let report = OutcomeReport {
            lease_token: lease,
            outcome: Outcome::Failure {
                kind: FailureKind::EncoderCrash,
                message: "ffmpeg exited with code 1".to_string(),
                retryable: true,
            },
        };
        fx.lifecycle.handle_report(id, &report, 2_000).unwrap();

        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(fx.registry.worker("w1").unwrap().jobs_failed, 1);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            Event::FileStateChanged {
                status: FileStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn test_success_report_without_upload_commit_rolls_back() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);

        let report = OutcomeReport {
            lease_token: lease,
            outcome: Outcome::Success {
                output_size_bytes: 900_000_000,
            },
        };
        fx.lifecycle.handle_report(id, &report, 2_000).unwrap();

        // No upload ever committed, so the file must not read completed.
        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert!(record.output_size_bytes.is_none());
    }

    #[test]
    fn test_insufficient_savings_rejection_skips_file() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);

        fx.lifecycle
            .reject_insufficient_savings(id, &lease, 2_000_000_000, 1_940_000_000, 2_000)
            .unwrap();

        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Skipped);
        assert_eq!(
            record.last_error_kind.as_deref(),
            Some("output_smaller_than_threshold")
        );
    }

    #[test]
    fn test_cancel_queues_directive_for_next_heartbeat() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);

        assert!(fx.lifecycle.request_cancel(id).unwrap());

        let resp = fx
            .registry
            .heartbeat(
                "w1",
                &HeartbeatRequest {
                    cpu_percent: 10.0,
                    memory_percent: 10.0,
                    current: None,
                },
                2_000,
            )
            .unwrap();
        assert_eq!(resp.cancel.as_deref(), Some(lease.as_str()));

        // Cancelling a pending file is a no-op.
        fx.store.reap_assignment(id, 3_000).unwrap();
        assert!(!fx.lifecycle.request_cancel(id).unwrap());
    }

    #[test]
    fn test_sweep_force_fails_silent_processing_job() {
        let fx = fixture();
        register(&fx, "w1", 1_000);
        let (id, lease) = claimed_file(&fx, "w1", 1_000);
        fx.lifecycle
            .handle_progress(id, &progress(&lease, 10.0), 2_000)
            .unwrap();

        // Keep the worker alive with heartbeats but starve the job of
        // progress past the 300 s silence timeout.
        fx.registry.heartbeat(
            "w1",
            &HeartbeatRequest {
                cpu_percent: 1.0,
                memory_percent: 1.0,
                current: None,
            },
            300_000,
        );
        fx.lifecycle.sweep(305_000).unwrap();

        let record = fx.store.file(id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Pending);
        assert_eq!(record.last_error_kind.as_deref(), Some("stalled"));
    }

    #[test]
    fn test_sweep_reaps_orphan_after_restart_grace() {
        // Simulates a coordinator restart: the store knows the assignment,
        // the registry has never seen the worker.
        let fx = fixture();
        let (id, _lease) = claimed_file(&fx, "w_gone", 1_000);

        // Within the liveness window the orphan is left alone, giving a
        // live worker time to re-register.
        fx.lifecycle.sweep(20_000).unwrap();
        assert_eq!(
            fx.store.file(id).unwrap().unwrap().status,
            FileStatus::Assigned
        );

        fx.lifecycle.sweep(40_000).unwrap();
        assert_eq!(
            fx.store.file(id).unwrap().unwrap().status,
            FileStatus::Pending
        );
    }
}
