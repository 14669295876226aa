//! Durable job queue backed by sqlite.
//!
//! The store is the single source of truth for file state: every mutation in
//! the system funnels through one write-locked connection, and every
//! worker-originated mutation is gated on the lease token issued with the
//! assignment. The database survives kill -9 via WAL journaling; workers and
//! their registry entries deliberately do not.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use av1_farm_config::FileOrder;
use av1_farm_protocol::{FileStatus, HdrKind, SourceProfile, TargetSettings};

/// Current schema version; bumped with every migration step.
const SCHEMA_VERSION: i64 = 1;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying sqlite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Referenced file does not exist.
    #[error("file {0} not found")]
    NotFound(i64),

    /// On-disk schema is newer than this binary understands.
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

/// One row of the `files` table. The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub directory: String,
    pub filename: String,
    pub size_bytes: u64,
    /// Source modification time, unix milliseconds.
    pub mtime: i64,
    pub status: FileStatus,
    pub priority: i32,
    pub preferred_worker_id: Option<String>,
    pub assigned_worker_id: Option<String>,
    pub assigned_at: Option<i64>,
    pub last_progress_at: Option<i64>,
    pub lease_token: Option<String>,
    /// Blake3 hex of the source bytes, computed when the file is claimed.
    pub content_hash: Option<String>,
    pub source_codec: Option<String>,
    pub source_resolution: Option<String>,
    pub source_audio_codec: Option<String>,
    pub source_bitrate: Option<i64>,
    pub hdr_kind: Option<HdrKind>,
    pub target_crf: Option<u8>,
    pub target_audio_bitrate: Option<u32>,
    pub progress_percent: f64,
    pub speed_fps: Option<f64>,
    pub eta_seconds: Option<i64>,
    pub output_size_bytes: Option<u64>,
    pub savings_bytes: Option<i64>,
    pub savings_percent: Option<f64>,
    pub attempt_count: u32,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub error_at: Option<i64>,
    /// When this record last (re-)entered `pending`; anchors the pin grace.
    pub pending_since: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Result of a scan upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// New record inserted as pending.
    Added,
    /// Existing pending/failed record refreshed with new size/mtime.
    Updated,
    /// Completed record whose source changed on disk; re-enqueued.
    Requeued,
    /// Nothing to do.
    Unchanged,
}

/// Result of a lease-gated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCheck {
    /// Lease matched, mutation applied.
    Applied,
    /// Lease did not match the current assignment; nothing changed.
    Stale,
}

/// Result of `record_completion`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionResult {
    /// First completion for this assignment.
    Completed {
        savings_bytes: i64,
        savings_percent: f64,
    },
    /// The record is already completed; duplicate delivery, no change.
    AlreadyCompleted,
    /// Lease did not match; no change.
    Stale,
}

/// Result of `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResult {
    /// Returned to pending for another attempt.
    Requeued { attempt_count: u32 },
    /// Attempt budget exhausted or fatal kind; parked as failed.
    Parked,
    /// Lease did not match or record already terminal; no change.
    Stale,
}

/// Aggregate queue statistics for the UI snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_files: u64,
    pub pending_files: u64,
    pub assigned_files: u64,
    pub processing_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_size_bytes: u64,
    pub total_output_bytes: u64,
    pub total_savings_bytes: i64,
    pub avg_savings_percent: f64,
}

/// One row of the `stats_daily` aggregate table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub day: String,
    pub files_completed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_saved: i64,
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sqlite-backed queue store. All access is serialized through an internal
/// mutex: one writer, and readers that never observe a torn transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // journal_mode answers with the resulting mode, so it goes through
        // query_row rather than the batch path.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
              version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              path TEXT UNIQUE NOT NULL,
              directory TEXT NOT NULL,
              filename TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              mtime INTEGER NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              priority INTEGER NOT NULL DEFAULT 0,
              preferred_worker_id TEXT,

              assigned_worker_id TEXT,
              assigned_at INTEGER,
              last_progress_at INTEGER,
              lease_token TEXT,
              content_hash TEXT,

              source_codec TEXT,
              source_resolution TEXT,
              source_audio_codec TEXT,
              source_bitrate INTEGER,
              hdr_kind TEXT,

              target_crf INTEGER,
              target_audio_bitrate INTEGER,

              progress_percent REAL NOT NULL DEFAULT 0,
              speed_fps REAL,
              eta_seconds INTEGER,

              output_size_bytes INTEGER,
              savings_bytes INTEGER,
              savings_percent REAL,

              attempt_count INTEGER NOT NULL DEFAULT 0,
              last_error_kind TEXT,
              last_error_message TEXT,
              error_at INTEGER,

              pending_since INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_files_claim
              ON files(status, priority DESC, id ASC);
            CREATE INDEX IF NOT EXISTS idx_files_pin
              ON files(preferred_worker_id, status);
            CREATE INDEX IF NOT EXISTS idx_files_worker
              ON files(assigned_worker_id);

            CREATE TABLE IF NOT EXISTS stats_daily (
              day TEXT PRIMARY KEY NOT NULL,
              files_completed INTEGER NOT NULL DEFAULT 0,
              bytes_in INTEGER NOT NULL DEFAULT 0,
              bytes_out INTEGER NOT NULL DEFAULT 0,
              bytes_saved INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS control (
              key TEXT PRIMARY KEY NOT NULL,
              value TEXT NOT NULL
            );
            "#,
        )?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::SchemaTooNew {
                    found: v,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(_) => {
                // Forward migrations slot in here as the schema evolves.
            }
        }

        Ok(())
    }

    // ---- scanning ----------------------------------------------------------

    /// Insert or refresh a record from a scan observation.
    ///
    /// In-flight records are never touched. Pending and failed records get
    /// their size/mtime refreshed. A completed record whose source bytes
    /// changed on disk (size or mtime drifted) is re-enqueued.
    pub fn upsert_scan(
        &self,
        path: &Path,
        size_bytes: u64,
        mtime: i64,
        now: i64,
    ) -> Result<ScanOutcome, StoreError> {
        let directory = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path_str = path.to_string_lossy().to_string();

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let existing: Option<(i64, String, u64, i64, Option<i64>)> = tx
            .query_row(
                "SELECT id, status, size_bytes, mtime, output_size_bytes
                 FROM files WHERE path = ?1",
                params![path_str],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO files
                       (path, directory, filename, size_bytes, mtime, status,
                        pending_since, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6, ?6)",
                    params![path_str, directory, filename, size_bytes as i64, mtime, now],
                )?;
                ScanOutcome::Added
            }
            Some((id, status, old_size, old_mtime, output_size)) => {
                let status = FileStatus::parse(&status).unwrap_or(FileStatus::Pending);
                match status {
                    FileStatus::Pending | FileStatus::Failed => {
                        if old_size == size_bytes && old_mtime == mtime {
                            ScanOutcome::Unchanged
                        } else {
                            tx.execute(
                                "UPDATE files SET size_bytes = ?1, mtime = ?2, updated_at = ?3
                                 WHERE id = ?4",
                                params![size_bytes as i64, mtime, now, id],
                            )?;
                            ScanOutcome::Updated
                        }
                    }
                    FileStatus::Completed => {
                        // After a successful swap the bytes on disk ARE the
                        // encode output, so "did the source change" compares
                        // against the recorded output size, not the original
                        // source size. A bare mtime drift is ignored.
                        let expected = output_size.map(|v| v as u64).unwrap_or(old_size);
                        if size_bytes == expected {
                            ScanOutcome::Unchanged
                        } else {
                            // Rewritten on disk after we finished with it;
                            // queue it again from scratch.
                            tx.execute(
                                "UPDATE files SET
                                   size_bytes = ?1, mtime = ?2, status = 'pending',
                                   progress_percent = 0, attempt_count = 0,
                                   output_size_bytes = NULL, savings_bytes = NULL,
                                   savings_percent = NULL, completed_at = NULL,
                                   last_error_kind = NULL, last_error_message = NULL,
                                   error_at = NULL, pending_since = ?3, updated_at = ?3
                                 WHERE id = ?4",
                                params![size_bytes as i64, mtime, now, id],
                            )?;
                            ScanOutcome::Requeued
                        }
                    }
                    // In-flight and skipped records are left alone.
                    _ => ScanOutcome::Unchanged,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    // ---- claiming ----------------------------------------------------------

    /// Atomically claim the best pending file for `worker_id`.
    ///
    /// Ordering: pin match first, then priority, then the cluster ordering
    /// key, with `id` as the stable tie-break. Files pinned to another worker
    /// are invisible to this one until the pin grace has elapsed since the
    /// file last became pending. On success the record moves to `assigned`
    /// with a fresh lease token and a bumped attempt count.
    pub fn claim_next(
        &self,
        worker_id: &str,
        order: FileOrder,
        pin_grace_ms: i64,
        now: i64,
    ) -> Result<Option<FileRecord>, StoreError> {
        let order_clause = match order {
            FileOrder::OldestMtime => "mtime ASC",
            FileOrder::NewestMtime => "mtime DESC",
            FileOrder::LargestSize => "size_bytes DESC",
            FileOrder::SmallestSize => "size_bytes ASC",
        };
        let sql = format!(
            "SELECT id FROM files
             WHERE status = 'pending'
               AND (preferred_worker_id IS NULL
                    OR preferred_worker_id = ?1
                    OR pending_since + ?2 <= ?3)
             ORDER BY
               CASE WHEN preferred_worker_id = ?1 THEN 1 ELSE 0 END DESC,
               priority DESC,
               {order_clause},
               id ASC
             LIMIT 1"
        );

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let candidate: Option<i64> = tx
            .query_row(&sql, params![worker_id, pin_grace_ms, now], |row| {
                row.get(0)
            })
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let lease = Uuid::new_v4().to_string();
        let updated = tx.execute(
            "UPDATE files SET
               status = 'assigned', assigned_worker_id = ?1, assigned_at = ?2,
               last_progress_at = ?2, lease_token = ?3,
               attempt_count = attempt_count + 1,
               progress_percent = 0, updated_at = ?2
             WHERE id = ?4 AND status = 'pending'",
            params![worker_id, now, lease, id],
        )?;
        if updated != 1 {
            // Lost the race inside our own lock should be impossible, but a
            // claim against a row another path just mutated simply yields
            // nothing and the scheduler retries.
            return Ok(None);
        }

        let record = query_file(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        tx.commit()?;
        Ok(Some(record))
    }

    // ---- worker reports ----------------------------------------------------

    /// Apply a progress report. The first progress on an assignment moves it
    /// `assigned` -> `processing`. Stale leases are rejected without change.
    pub fn record_progress(
        &self,
        file_id: i64,
        lease: &str,
        percent: f64,
        fps: f64,
        eta_seconds: u64,
        now: i64,
    ) -> Result<LeaseCheck, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        if !lease_matches_in_flight(&tx, file_id, lease)? {
            return Ok(LeaseCheck::Stale);
        }

        tx.execute(
            "UPDATE files SET
               status = 'processing', progress_percent = ?1, speed_fps = ?2,
               eta_seconds = ?3, last_progress_at = ?4, updated_at = ?4
             WHERE id = ?5",
            params![percent.clamp(0.0, 100.0), fps, eta_seconds as i64, now, file_id],
        )?;
        tx.commit()?;
        Ok(LeaseCheck::Applied)
    }

    /// Record probed source metadata and the policy's target settings,
    /// reported by the worker alongside its first progress.
    pub fn record_source_metadata(
        &self,
        file_id: i64,
        lease: &str,
        source: &SourceProfile,
        target: Option<TargetSettings>,
        now: i64,
    ) -> Result<LeaseCheck, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        if !lease_matches_in_flight(&tx, file_id, lease)? {
            return Ok(LeaseCheck::Stale);
        }

        let resolution = format!("{}x{}", source.width, source.height);
        let first_audio = source.audio.first();
        tx.execute(
            "UPDATE files SET
               source_codec = ?1, source_resolution = ?2, source_audio_codec = ?3,
               source_bitrate = ?4, hdr_kind = ?5,
               target_crf = COALESCE(?6, target_crf),
               target_audio_bitrate = COALESCE(?7, target_audio_bitrate),
               updated_at = ?8
             WHERE id = ?9",
            params![
                source.video_codec,
                resolution,
                first_audio.map(|a| a.codec.as_str()),
                source.bitrate as i64,
                source.hdr_kind().as_str(),
                target.map(|t| t.crf as i64),
                target.map(|t| t.audio_bitrate_kbps as i64),
                now,
                file_id,
            ],
        )?;
        tx.commit()?;
        Ok(LeaseCheck::Applied)
    }

    /// Transition to `completed`. Idempotent: a duplicate delivery for an
    /// already completed record (same lease or not) changes nothing.
    pub fn record_completion(
        &self,
        file_id: i64,
        lease: &str,
        output_size_bytes: u64,
        now: i64,
    ) -> Result<CompletionResult, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>, u64)> = tx
            .query_row(
                "SELECT status, lease_token, size_bytes FROM files WHERE id = ?1",
                params![file_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                },
            )
            .optional()?;
        let Some((status, current_lease, size_bytes)) = row else {
            return Err(StoreError::NotFound(file_id));
        };

        if FileStatus::parse(&status) == Some(FileStatus::Completed) {
            return Ok(CompletionResult::AlreadyCompleted);
        }
        if current_lease.as_deref() != Some(lease) {
            return Ok(CompletionResult::Stale);
        }

        let savings_bytes = size_bytes as i64 - output_size_bytes as i64;
        let savings_percent = if size_bytes > 0 {
            savings_bytes as f64 / size_bytes as f64 * 100.0
        } else {
            0.0
        };

        tx.execute(
            "UPDATE files SET
               status = 'completed', output_size_bytes = ?1, savings_bytes = ?2,
               savings_percent = ?3, progress_percent = 100,
               assigned_worker_id = NULL, assigned_at = NULL, lease_token = NULL,
               last_error_kind = NULL, last_error_message = NULL,
               completed_at = ?4, updated_at = ?4
             WHERE id = ?5",
            params![
                output_size_bytes as i64,
                savings_bytes,
                savings_percent,
                now,
                file_id
            ],
        )?;

        // Keep the daily aggregate in the same transaction so a crash cannot
        // separate the completion from its stats row.
        let day = Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();
        tx.execute(
            "INSERT INTO stats_daily (day, files_completed, bytes_in, bytes_out, bytes_saved)
             VALUES (?1, 1, ?2, ?3, ?4)
             ON CONFLICT(day) DO UPDATE SET
               files_completed = files_completed + 1,
               bytes_in = bytes_in + excluded.bytes_in,
               bytes_out = bytes_out + excluded.bytes_out,
               bytes_saved = bytes_saved + excluded.bytes_saved",
            params![day, size_bytes as i64, output_size_bytes as i64, savings_bytes],
        )?;

        tx.commit()?;
        Ok(CompletionResult::Completed {
            savings_bytes,
            savings_percent,
        })
    }

    /// Record a failure. Retryable kinds with attempt budget left go back to
    /// `pending`; everything else parks as `failed`.
    pub fn record_failure(
        &self,
        file_id: i64,
        lease: &str,
        kind: &str,
        message: &str,
        retryable: bool,
        max_attempts: u32,
        now: i64,
    ) -> Result<FailureResult, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>, u32)> = tx
            .query_row(
                "SELECT status, lease_token, attempt_count FROM files WHERE id = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u32)),
            )
            .optional()?;
        let Some((status, current_lease, attempt_count)) = row else {
            return Err(StoreError::NotFound(file_id));
        };

        let status = FileStatus::parse(&status).unwrap_or(FileStatus::Pending);
        if status.is_terminal() || current_lease.as_deref() != Some(lease) {
            return Ok(FailureResult::Stale);
        }

        let result = if retryable && attempt_count < max_attempts {
            tx.execute(
                "UPDATE files SET
                   status = 'pending', assigned_worker_id = NULL, assigned_at = NULL,
                   lease_token = NULL, progress_percent = 0, speed_fps = NULL,
                   eta_seconds = NULL, last_error_kind = ?1, last_error_message = ?2,
                   error_at = ?3, pending_since = ?3, updated_at = ?3
                 WHERE id = ?4",
                params![kind, message, now, file_id],
            )?;
            FailureResult::Requeued { attempt_count }
        } else {
            tx.execute(
                "UPDATE files SET
                   status = 'failed', assigned_worker_id = NULL, assigned_at = NULL,
                   lease_token = NULL, speed_fps = NULL, eta_seconds = NULL,
                   last_error_kind = ?1, last_error_message = ?2,
                   error_at = ?3, updated_at = ?3
                 WHERE id = ?4",
                params![kind, message, now, file_id],
            )?;
            FailureResult::Parked
        };

        tx.commit()?;
        Ok(result)
    }

    /// Transition to terminal `skipped`. When `lease` is given the call is
    /// worker-originated and lease-gated; operators skip without one.
    pub fn record_skip(
        &self,
        file_id: i64,
        lease: Option<&str>,
        reason: &str,
        message: &str,
        now: i64,
    ) -> Result<LeaseCheck, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, lease_token FROM files WHERE id = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, current_lease)) = row else {
            return Err(StoreError::NotFound(file_id));
        };

        let status = FileStatus::parse(&status).unwrap_or(FileStatus::Pending);
        if status.is_terminal() {
            return Ok(LeaseCheck::Stale);
        }
        if let Some(lease) = lease {
            if current_lease.as_deref() != Some(lease) {
                return Ok(LeaseCheck::Stale);
            }
        }

        tx.execute(
            "UPDATE files SET
               status = 'skipped', assigned_worker_id = NULL, assigned_at = NULL,
               lease_token = NULL, speed_fps = NULL, eta_seconds = NULL,
               last_error_kind = ?1, last_error_message = ?2,
               completed_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![reason, message, now, file_id],
        )?;
        tx.commit()?;
        Ok(LeaseCheck::Applied)
    }

    /// Discard a dead worker's assignment and make the file immediately
    /// re-eligible. Only applies while the record is in flight; the attempt
    /// count is kept.
    pub fn reap_assignment(&self, file_id: i64, now: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let updated = conn.execute(
            "UPDATE files SET
               status = 'pending', assigned_worker_id = NULL, assigned_at = NULL,
               lease_token = NULL, progress_percent = 0, speed_fps = NULL,
               eta_seconds = NULL, last_error_kind = 'worker_offline',
               last_error_message = 'Worker stopped heartbeating', error_at = ?1,
               pending_since = ?1, updated_at = ?1
             WHERE id = ?2 AND status IN ('assigned', 'processing')",
            params![now, file_id],
        )?;
        Ok(updated == 1)
    }

    // ---- admin operations --------------------------------------------------

    /// Set priority and optionally pin to a worker. A failed record is
    /// revived to pending in the same stroke, matching operator expectations
    /// when they bump something they want done now.
    pub fn set_priority(
        &self,
        file_id: i64,
        priority: i32,
        preferred_worker_id: Option<&str>,
        now: i64,
    ) -> Result<FileRecord, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM files WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Err(StoreError::NotFound(file_id));
        };

        tx.execute(
            "UPDATE files SET priority = ?1, preferred_worker_id = ?2, updated_at = ?3
             WHERE id = ?4",
            params![priority, preferred_worker_id, now, file_id],
        )?;

        if FileStatus::parse(&status) == Some(FileStatus::Failed) {
            tx.execute(
                "UPDATE files SET
                   status = 'pending', progress_percent = 0, last_error_kind = NULL,
                   last_error_message = NULL, error_at = NULL,
                   pending_since = ?1, updated_at = ?1
                 WHERE id = ?2",
                params![now, file_id],
            )?;
        }

        let record = query_file(&tx, file_id)?.ok_or(StoreError::NotFound(file_id))?;
        tx.commit()?;
        Ok(record)
    }

    /// Full operator reset to pending: wipes results, errors and the attempt
    /// budget. Does not touch priority or the pin.
    pub fn reset_file(&self, file_id: i64, now: i64) -> Result<FileRecord, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE files SET
               status = 'pending', assigned_worker_id = NULL, assigned_at = NULL,
               lease_token = NULL, progress_percent = 0, speed_fps = NULL,
               eta_seconds = NULL, output_size_bytes = NULL, savings_bytes = NULL,
               savings_percent = NULL, attempt_count = 0, last_error_kind = NULL,
               last_error_message = NULL, error_at = NULL, completed_at = NULL,
               pending_since = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, file_id],
        )?;
        if updated != 1 {
            return Err(StoreError::NotFound(file_id));
        }
        let record = query_file(&tx, file_id)?.ok_or(StoreError::NotFound(file_id))?;
        tx.commit()?;
        Ok(record)
    }

    /// Operator retry: back to pending but the attempt history survives.
    pub fn retry_file(&self, file_id: i64, now: i64) -> Result<FileRecord, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE files SET
               status = 'pending', assigned_worker_id = NULL, assigned_at = NULL,
               lease_token = NULL, progress_percent = 0, speed_fps = NULL,
               eta_seconds = NULL, pending_since = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, file_id],
        )?;
        if updated != 1 {
            return Err(StoreError::NotFound(file_id));
        }
        let record = query_file(&tx, file_id)?.ok_or(StoreError::NotFound(file_id))?;
        tx.commit()?;
        Ok(record)
    }

    /// Delete a record outright.
    pub fn delete_file(&self, file_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let deleted = conn.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        if deleted != 1 {
            return Err(StoreError::NotFound(file_id));
        }
        Ok(())
    }

    /// Reset every failed record to pending. Returns how many were revived.
    pub fn bulk_reset_failed(&self, now: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.execute(
            "UPDATE files SET
               status = 'pending', progress_percent = 0, attempt_count = 0,
               last_error_kind = NULL, last_error_message = NULL, error_at = NULL,
               pending_since = ?1, updated_at = ?1
             WHERE status = 'failed'",
            params![now],
        )?;
        Ok(count)
    }

    /// Delete every completed record. Returns how many rows went away.
    pub fn bulk_delete_completed(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.execute("DELETE FROM files WHERE status = 'completed'", [])?;
        Ok(count)
    }

    // ---- pause flag --------------------------------------------------------

    /// Whether the operator paused dispatch. In-flight jobs keep running.
    pub fn is_paused(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM control WHERE key = 'paused'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("true"))
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO control (key, value) VALUES ('paused', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![if paused { "true" } else { "false" }],
        )?;
        Ok(())
    }

    // ---- queries -----------------------------------------------------------

    pub fn file(&self, file_id: i64) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        query_file(&conn, file_id)
    }

    /// All files, newest first, optionally filtered by status.
    pub fn files(&self, status: Option<FileStatus>) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM files WHERE status = ?1 ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt.query_map(params![status.as_str()], record_from_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM files ORDER BY created_at DESC, id DESC")?;
                let rows = stmt.query_map([], record_from_row)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    /// The most interesting files for the UI: in-flight first, then pending
    /// by queue order, capped at `limit`.
    pub fn top_files(&self, limit: usize) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM files
             WHERE status IN ('assigned', 'processing', 'pending')
             ORDER BY
               CASE status WHEN 'processing' THEN 0 WHEN 'assigned' THEN 1 ELSE 2 END,
               priority DESC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// The assignment a worker currently holds, if any.
    pub fn assignment_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM files
             WHERE assigned_worker_id = ?1 AND status IN ('assigned', 'processing')
             LIMIT 1",
        )?;
        let record = stmt
            .query_row(params![worker_id], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Every record currently holding an assignment.
    pub fn in_flight(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare("SELECT * FROM files WHERE status IN ('assigned', 'processing')")?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// In-flight files whose last progress predates `cutoff`; these have
    /// gone silent and get force-failed by the sweeper. Claiming stamps
    /// `last_progress_at`, so an assignment that never reports at all is
    /// caught by the same query.
    pub fn stalled_files(&self, cutoff: i64) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM files
             WHERE status IN ('assigned', 'processing') AND last_progress_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Aggregate statistics for the status snapshot.
    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let stats = conn.query_row(
            "SELECT
               COUNT(*),
               COUNT(*) FILTER (WHERE status = 'pending'),
               COUNT(*) FILTER (WHERE status = 'assigned'),
               COUNT(*) FILTER (WHERE status = 'processing'),
               COUNT(*) FILTER (WHERE status = 'completed'),
               COUNT(*) FILTER (WHERE status = 'failed'),
               COUNT(*) FILTER (WHERE status = 'skipped'),
               COALESCE(SUM(size_bytes), 0),
               COALESCE(SUM(output_size_bytes) FILTER (WHERE status = 'completed'), 0),
               COALESCE(SUM(savings_bytes) FILTER (WHERE status = 'completed'), 0),
               COALESCE(AVG(savings_percent) FILTER (WHERE status = 'completed'), 0)
             FROM files",
            [],
            |row| {
                Ok(QueueStats {
                    total_files: row.get::<_, i64>(0)? as u64,
                    pending_files: row.get::<_, i64>(1)? as u64,
                    assigned_files: row.get::<_, i64>(2)? as u64,
                    processing_files: row.get::<_, i64>(3)? as u64,
                    completed_files: row.get::<_, i64>(4)? as u64,
                    failed_files: row.get::<_, i64>(5)? as u64,
                    skipped_files: row.get::<_, i64>(6)? as u64,
                    total_size_bytes: row.get::<_, i64>(7)? as u64,
                    total_output_bytes: row.get::<_, i64>(8)? as u64,
                    total_savings_bytes: row.get::<_, i64>(9)?,
                    avg_savings_percent: row.get(10)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Recent daily aggregates, newest first.
    pub fn daily_stats(&self, limit: usize) -> Result<Vec<DailyStats>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT day, files_completed, bytes_in, bytes_out, bytes_saved
             FROM stats_daily ORDER BY day DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(DailyStats {
                day: row.get(0)?,
                files_completed: row.get::<_, i64>(1)? as u64,
                bytes_in: row.get::<_, i64>(2)? as u64,
                bytes_out: row.get::<_, i64>(3)? as u64,
                bytes_saved: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Record the source content hash computed after a claim. Lease-gated so
    /// a reassignment racing the hash job cannot attach a stale digest.
    pub fn set_content_hash(
        &self,
        file_id: i64,
        lease: &str,
        content_hash: &str,
    ) -> Result<LeaseCheck, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        if !lease_matches_in_flight(&tx, file_id, lease)? {
            return Ok(LeaseCheck::Stale);
        }
        tx.execute(
            "UPDATE files SET content_hash = ?1 WHERE id = ?2",
            params![content_hash, file_id],
        )?;
        tx.commit()?;
        Ok(LeaseCheck::Applied)
    }

    /// Path of a file by id, for transfer handlers.
    pub fn file_path(&self, file_id: i64) -> Result<Option<PathBuf>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let path: Option<String> = conn
            .query_row(
                "SELECT path FROM files WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }
}

/// True when the record exists, is in flight, and carries exactly this lease.
fn lease_matches_in_flight(
    conn: &Connection,
    file_id: i64,
    lease: &str,
) -> Result<bool, StoreError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, lease_token FROM files WHERE id = ?1",
            params![file_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((status, current_lease)) = row else {
        return Ok(false);
    };
    let status = FileStatus::parse(&status).unwrap_or(FileStatus::Pending);
    Ok(status.is_in_flight() && current_lease.as_deref() == Some(lease))
}

fn query_file(conn: &Connection, file_id: i64) -> Result<Option<FileRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT * FROM files WHERE id = ?1",
            params![file_id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let status: String = row.get("status")?;
    let hdr_kind: Option<String> = row.get("hdr_kind")?;
    Ok(FileRecord {
        id: row.get("id")?,
        path: row.get("path")?,
        directory: row.get("directory")?,
        filename: row.get("filename")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        mtime: row.get("mtime")?,
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Pending),
        priority: row.get("priority")?,
        preferred_worker_id: row.get("preferred_worker_id")?,
        assigned_worker_id: row.get("assigned_worker_id")?,
        assigned_at: row.get("assigned_at")?,
        last_progress_at: row.get("last_progress_at")?,
        lease_token: row.get("lease_token")?,
        content_hash: row.get("content_hash")?,
        source_codec: row.get("source_codec")?,
        source_resolution: row.get("source_resolution")?,
        source_audio_codec: row.get("source_audio_codec")?,
        source_bitrate: row.get("source_bitrate")?,
        hdr_kind: hdr_kind.as_deref().and_then(HdrKind::parse),
        target_crf: row.get::<_, Option<i64>>("target_crf")?.map(|v| v as u8),
        target_audio_bitrate: row
            .get::<_, Option<i64>>("target_audio_bitrate")?
            .map(|v| v as u32),
        progress_percent: row.get("progress_percent")?,
        speed_fps: row.get("speed_fps")?,
        eta_seconds: row.get("eta_seconds")?,
        output_size_bytes: row
            .get::<_, Option<i64>>("output_size_bytes")?
            .map(|v| v as u64),
        savings_bytes: row.get("savings_bytes")?,
        savings_percent: row.get("savings_percent")?,
        attempt_count: row.get::<_, i64>("attempt_count")? as u32,
        last_error_kind: row.get("last_error_kind")?,
        last_error_message: row.get("last_error_message")?,
        error_at: row.get("error_at")?,
        pending_since: row.get("pending_since")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        completed_at: row.get("completed_at")?,
    })
}
