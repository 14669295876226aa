//! Bounded pub/sub fan-out of progress and state-change events.
//!
//! Built on `tokio::sync::broadcast`: every subscriber gets its own cursor
//! into a bounded ring, and a subscriber that falls more than the backlog
//! behind is cut loose with a `Lagged` error instead of stalling the
//! publishers. The WebSocket adapter answers that by dropping the connection;
//! the client resubscribes and receives a fresh snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use av1_farm_protocol::{FileStatus, Phase};

use crate::store::{now_ms, FileRecord};

/// Maximum events a slow subscriber may fall behind before disconnection.
pub const DEFAULT_BACKLOG: usize = 1000;

/// Minimum milliseconds between published progress ticks per file (5/s).
const PROGRESS_MIN_INTERVAL_MS: i64 = 200;

/// Everything the UI stream can carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A file moved to a new queue state.
    FileStateChanged {
        file_id: i64,
        status: FileStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A progress tick, rate-limited per file before publication.
    Progress {
        file_id: i64,
        worker_id: String,
        percent: f64,
        fps: f64,
        eta_seconds: u64,
        phase: Phase,
    },
    /// A worker registered (or re-registered).
    WorkerRegistered { worker_id: String },
    /// A worker went silent past the liveness timeout.
    WorkerOffline { worker_id: String },
    /// A worker's fade-out flag was toggled.
    WorkerFadeOut { worker_id: String, fade_out: bool },
    /// A library scan finished.
    ScanCompleted { added: usize, updated: usize },
}

impl Event {
    /// Build a state-change event from a file record.
    pub fn state_changed(file: &FileRecord) -> Self {
        Event::FileStateChanged {
            file_id: file.id,
            status: file.status,
            worker_id: file.assigned_worker_id.clone(),
            detail: file.last_error_message.clone(),
        }
    }
}

/// Fan-out hub. Cheap to clone a sender handle out of; subscribers are
/// independent and disposable.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    /// Per-file timestamp of the last published progress tick.
    progress_gate: Mutex<HashMap<i64, i64>>,
}

impl EventBus {
    pub fn new(backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        Self {
            tx,
            progress_gate: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the live stream. The caller is responsible for pairing
    /// this with a snapshot; see the `/events` handler.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers. Lost sends (no subscribers) are
    /// fine; the queue does not care whether anyone is watching.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Publish a progress tick unless this file published one within the
    /// rate-limit window. State changes never pass through here and are
    /// never dropped.
    pub fn publish_progress(
        &self,
        file_id: i64,
        worker_id: &str,
        percent: f64,
        fps: f64,
        eta_seconds: u64,
        phase: Phase,
    ) {
        let now = now_ms();
        {
            let mut gate = self.progress_gate.lock().expect("event gate poisoned");
            if let Some(last) = gate.get(&file_id) {
                if now - last < PROGRESS_MIN_INTERVAL_MS {
                    return;
                }
            }
            gate.insert(file_id, now);
        }
        self.publish(Event::Progress {
            file_id,
            worker_id: worker_id.to_string(),
            percent,
            fps,
            eta_seconds,
            phase,
        });
    }

    /// Forget the rate-limit cursor for a finished file.
    pub fn clear_progress_gate(&self, file_id: i64) {
        let mut gate = self.progress_gate.lock().expect("event gate poisoned");
        gate.remove(&file_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}
