//! In-memory worker registry.
//!
//! Workers are ephemeral: registration state does not survive a coordinator
//! restart, and a worker that reconnects under its stable id simply lands on
//! a fresh entry. The durable consequences of a worker vanishing (its
//! assignment) live in the store and are handled by the sweeper.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use av1_farm_protocol::{
    HeartbeatRequest, HeartbeatResponse, Phase, RegisterRequest, WorkerCapabilities, WorkerStatus,
};

/// Smoothing factor for the per-worker encode speed average.
const EWMA_ALPHA: f64 = 0.3;

/// Registry view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    pub display_name: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    /// Operator toggle: keep reporting, receive no new work.
    pub fade_out: bool,
    pub registered_at: i64,
    pub last_heartbeat_at: i64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub current_file_id: Option<i64>,
    pub current_progress: f64,
    pub current_speed: f64,
    pub current_eta_seconds: u64,
    pub current_phase: Option<Phase>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Exponentially weighted moving average of reported encode fps.
    pub ewma_fps: Option<f64>,
}

/// Outcome of a liveness sweep over the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineWorker {
    pub worker_id: String,
    /// File the worker was holding when it went dark, if any.
    pub current_file_id: Option<i64>,
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<String, Worker>,
    /// Cancel directives waiting for the next heartbeat, keyed by worker id.
    pending_cancels: HashMap<String, String>,
}

/// Registration, heartbeats, liveness and fade-out for the worker fleet.
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a worker. Idempotent by worker id: a reconnect replaces the
    /// announcement fields but keeps the job counters of the old entry.
    pub fn register(&self, req: &RegisterRequest, now: i64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let (jobs_completed, jobs_failed) = inner
            .workers
            .get(&req.worker_id)
            .map(|w| (w.jobs_completed, w.jobs_failed))
            .unwrap_or((0, 0));

        inner.workers.insert(
            req.worker_id.clone(),
            Worker {
                id: req.worker_id.clone(),
                display_name: req.display_name.clone(),
                hostname: req.hostname.clone(),
                version: req.version.clone(),
                capabilities: req.capabilities.clone(),
                status: WorkerStatus::Idle,
                fade_out: false,
                registered_at: now,
                last_heartbeat_at: now,
                cpu_percent: 0.0,
                memory_percent: 0.0,
                current_file_id: None,
                current_progress: 0.0,
                current_speed: 0.0,
                current_eta_seconds: 0,
                current_phase: None,
                jobs_completed,
                jobs_failed,
                ewma_fps: None,
            },
        );
    }

    /// Apply a heartbeat. Returns `None` for unknown workers so the
    /// transport can answer 404 and trigger a re-registration.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        req: &HeartbeatRequest,
        now: i64,
    ) -> Option<HeartbeatResponse> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let cancel = inner.pending_cancels.remove(worker_id);
        let worker = match inner.workers.get_mut(worker_id) {
            Some(worker) => worker,
            None => {
                // Unknown worker with a pending cancel cannot happen, but do
                // not lose the directive if it does.
                if let Some(lease) = cancel {
                    inner.pending_cancels.insert(worker_id.to_string(), lease);
                }
                return None;
            }
        };

        worker.last_heartbeat_at = now;
        worker.cpu_percent = req.cpu_percent;
        worker.memory_percent = req.memory_percent;
        if worker.status == WorkerStatus::Offline {
            worker.status = if worker.current_file_id.is_some() {
                WorkerStatus::Processing
            } else {
                WorkerStatus::Idle
            };
        }
        if let Some(current) = &req.current {
            worker.current_progress = current.percent;
            worker.current_speed = current.fps;
            worker.current_eta_seconds = current.eta_seconds;
            worker.current_phase = Some(current.phase);
        }

        Some(HeartbeatResponse {
            fade_out: worker.fade_out,
            cancel,
        })
    }

    /// Queue a cancel directive; delivered with the worker's next heartbeat.
    pub fn request_cancel(&self, worker_id: &str, lease_token: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .pending_cancels
            .insert(worker_id.to_string(), lease_token.to_string());
    }

    /// Toggle fade-out. Returns the new value, or `None` if unknown.
    pub fn set_fade_out(&self, worker_id: &str, fade_out: bool) -> Option<bool> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.workers.get_mut(worker_id).map(|worker| {
            worker.fade_out = fade_out;
            worker.fade_out
        })
    }

    /// Record that a worker took an assignment.
    pub fn note_assignment(&self, worker_id: &str, file_id: i64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Processing;
            worker.current_file_id = Some(file_id);
            worker.current_progress = 0.0;
            worker.current_speed = 0.0;
            worker.current_eta_seconds = 0;
            worker.current_phase = None;
        }
    }

    /// Record a progress tick and fold the fps into the worker's EWMA.
    pub fn note_progress(&self, worker_id: &str, percent: f64, fps: f64, eta_seconds: u64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.current_progress = percent;
            worker.current_speed = fps;
            worker.current_eta_seconds = eta_seconds;
            if fps > 0.0 {
                worker.ewma_fps = Some(match worker.ewma_fps {
                    Some(prev) => EWMA_ALPHA * fps + (1.0 - EWMA_ALPHA) * prev,
                    None => fps,
                });
            }
        }
    }

    /// Record that a worker's current job reached a terminal state.
    pub fn note_job_finished(&self, worker_id: &str, success: bool) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            if worker.status != WorkerStatus::Offline {
                worker.status = WorkerStatus::Idle;
            }
            worker.current_file_id = None;
            worker.current_progress = 0.0;
            worker.current_speed = 0.0;
            worker.current_eta_seconds = 0;
            worker.current_phase = None;
            if success {
                worker.jobs_completed += 1;
            } else {
                worker.jobs_failed += 1;
            }
        }
    }

    /// Mark every worker silent past `liveness_timeout_ms` as offline and
    /// return them, with whatever file each was holding, so the sweeper can
    /// reap the assignments. Already offline workers are not returned twice.
    pub fn sweep_offline(&self, liveness_timeout_ms: i64, now: i64) -> Vec<OfflineWorker> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let mut newly_offline = Vec::new();
        for worker in inner.workers.values_mut() {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            if now - worker.last_heartbeat_at > liveness_timeout_ms {
                worker.status = WorkerStatus::Offline;
                newly_offline.push(OfflineWorker {
                    worker_id: worker.id.clone(),
                    current_file_id: worker.current_file_id.take(),
                });
            }
        }
        newly_offline
    }

    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.workers.get(worker_id).cloned()
    }

    pub fn is_known(&self, worker_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.workers.contains_key(worker_id)
    }

    /// All workers, for the status snapshot.
    pub fn snapshot(&self) -> Vec<Worker> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut workers: Vec<Worker> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
