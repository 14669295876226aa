//! Chunked, resumable byte transfer between coordinator and workers.
//!
//! Download streams source bytes to the worker with the blake3 digest in a
//! header; upload stages the encoded result in a hidden part-file next to
//! the target (same volume, so the final swap is a rename), verifies size
//! and hash, and only then lets SafeReplace touch the original. Both
//! directions are lease-gated; a reaped assignment gets `409 stale_lease`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Mutex;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};
use uuid::Uuid;

use av1_farm_protocol::UploadResponse;

use crate::safe_replace::{safe_replace, ReplaceError};
use crate::scheduler::hash_file;
use crate::store::{now_ms, CompletionResult, FileRecord};
use crate::SharedState;

/// Header carrying the blake3 hex digest of the transferred bytes.
pub const CONTENT_HASH_HEADER: &str = "x-content-hash";
/// Header carrying the total expected size of an uploaded result.
pub const OUTPUT_SIZE_HEADER: &str = "x-output-size";

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub lease: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub lease: String,
    #[serde(default)]
    pub offset: u64,
    /// Upload id from a previous attempt; present on resume.
    pub upload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadStatusQuery {
    pub lease: String,
}

#[derive(Debug)]
struct UploadSession {
    upload_id: String,
    lease: String,
    temp_path: PathBuf,
    received: u64,
    /// A request body is currently streaming into this session.
    active: bool,
}

/// What `begin_stream` hands the handler.
struct StreamTicket {
    upload_id: String,
    temp_path: PathBuf,
    start_offset: u64,
}

enum BeginError {
    /// Another request is streaming into this session right now.
    Busy,
    /// Offset does not line up with what the session already has.
    BadOffset { upload_id: String, received: u64 },
    /// Resume referenced an upload id the coordinator does not know.
    UnknownUpload,
}

/// Tracks in-progress result uploads. Keyed by file id; a worker holds at
/// most one assignment, so this also bounds uploads to one per worker.
pub struct UploadManager {
    sessions: Mutex<HashMap<i64, UploadSession>>,
}

impl UploadManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or resume) a session and mark it streaming.
    fn begin_stream(
        &self,
        file_id: i64,
        lease: &str,
        target: &FsPath,
        upload: Option<&str>,
        offset: u64,
    ) -> Result<StreamTicket, BeginError> {
        let mut sessions = self.sessions.lock().expect("upload sessions poisoned");

        match upload {
            Some(upload_id) => {
                let session = sessions.get_mut(&file_id).ok_or(BeginError::UnknownUpload)?;
                if session.upload_id != upload_id || session.lease != lease {
                    return Err(BeginError::UnknownUpload);
                }
                if session.active {
                    return Err(BeginError::Busy);
                }
                if offset != session.received {
                    return Err(BeginError::BadOffset {
                        upload_id: session.upload_id.clone(),
                        received: session.received,
                    });
                }
                session.active = true;
                Ok(StreamTicket {
                    upload_id: session.upload_id.clone(),
                    temp_path: session.temp_path.clone(),
                    start_offset: session.received,
                })
            }
            None => {
                if let Some(existing) = sessions.get(&file_id) {
                    if existing.active {
                        return Err(BeginError::Busy);
                    }
                    // A fresh start supersedes a stale session (e.g. the
                    // lease changed after a reap); drop its part-file.
                    let _ = std::fs::remove_file(&existing.temp_path);
                }
                if offset != 0 {
                    return Err(BeginError::BadOffset {
                        upload_id: String::new(),
                        received: 0,
                    });
                }
                let upload_id = Uuid::new_v4().to_string();
                let temp_path = part_path(target, &upload_id);
                sessions.insert(
                    file_id,
                    UploadSession {
                        upload_id: upload_id.clone(),
                        lease: lease.to_string(),
                        temp_path: temp_path.clone(),
                        received: 0,
                        active: true,
                    },
                );
                Ok(StreamTicket {
                    upload_id,
                    temp_path,
                    start_offset: 0,
                })
            }
        }
    }

    /// Record progress and release the streaming flag.
    fn end_stream(&self, file_id: i64, received: u64) {
        let mut sessions = self.sessions.lock().expect("upload sessions poisoned");
        if let Some(session) = sessions.get_mut(&file_id) {
            session.received = received;
            session.active = false;
        }
    }

    /// Remove a finished or abandoned session.
    fn take(&self, file_id: i64) -> Option<PathBuf> {
        let mut sessions = self.sessions.lock().expect("upload sessions poisoned");
        sessions.remove(&file_id).map(|s| s.temp_path)
    }

    fn status(&self, file_id: i64, lease: &str) -> Option<(String, u64)> {
        let sessions = self.sessions.lock().expect("upload sessions poisoned");
        sessions
            .get(&file_id)
            .filter(|s| s.lease == lease)
            .map(|s| (s.upload_id.clone(), s.received))
    }
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Part-file staged next to the target so the final swap is a same-volume
/// rename: `/m/film.mkv` stages at `/m/.film.mkv.part-1a2b3c4d`.
fn part_path(target: &FsPath, upload_id: &str) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| FsPath::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let tag: String = upload_id.chars().take(8).collect();
    dir.join(format!(".{name}.part-{tag}"))
}

/// Fetch the record and enforce the lease, or produce the 409 answer.
fn validated_record(
    state: &SharedState,
    file_id: i64,
    lease: &str,
) -> Result<FileRecord, Response> {
    let record = match state.store.file(file_id) {
        Ok(Some(record)) => record,
        Ok(None) => return Err(StatusCode::NOT_FOUND.into_response()),
        Err(err) => {
            error!(file_id, error = %err, "store lookup failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };
    if !record.status.is_in_flight() || record.lease_token.as_deref() != Some(lease) {
        let body = Json(UploadResponse {
            accepted: false,
            reason: Some("stale_lease".to_string()),
            ..Default::default()
        });
        return Err((StatusCode::CONFLICT, body).into_response());
    }
    Ok(record)
}

/// `GET /files/{id}/bytes?lease=L&offset=K`
///
/// Streams the source from `offset` with `Content-Length` and the whole-file
/// blake3 digest in `X-Content-Hash` so the worker can verify end to end
/// even across resumed ranges.
pub async fn download_bytes(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let record = match validated_record(&state, file_id, &query.lease) {
        Ok(record) => record,
        Err(response) => return response,
    };
    let Some(content_hash) = record.content_hash.clone() else {
        error!(file_id, "assignment without a content hash");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut file = match tokio::fs::File::open(&record.path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(file_id, path = %record.path, error = %err, "source unreadable for download");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let total = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            error!(file_id, error = %err, "failed to stat source");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if query.offset > total {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    if query.offset > 0 {
        if let Err(err) = file.seek(SeekFrom::Start(query.offset)).await {
            error!(file_id, error = %err, "failed to seek source");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let stream = ReaderStream::new(file);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, total - query.offset)
        .header(CONTENT_HASH_HEADER, content_hash)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /files/{id}/result/status?lease=L`
///
/// Resume probe: tells the worker which upload id to continue and from
/// which byte, after a dropped connection ate the previous response.
pub async fn upload_status(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Query(query): Query<UploadStatusQuery>,
) -> Response {
    if let Err(response) = validated_record(&state, file_id, &query.lease) {
        return response;
    }
    let (upload_id, received) = match state.uploads.status(file_id, &query.lease) {
        Some(status) => status,
        None => (String::new(), 0),
    };
    Json(UploadResponse {
        accepted: false,
        upload_id: if upload_id.is_empty() {
            None
        } else {
            Some(upload_id)
        },
        received_bytes: received,
        ..Default::default()
    })
    .into_response()
}

/// `POST /files/{id}/result?lease=L[&upload=U&offset=K]`
///
/// Receives the encoded bytes. On the final byte: verify exact size, verify
/// the blake3 digest, run SafeReplace, and record the completion. Every
/// rejection path leaves the original untouched.
pub async fn upload_result(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let record = match validated_record(&state, file_id, &query.lease) {
        Ok(record) => record,
        Err(response) => return response,
    };

    let Some(expected_hash) = header_str(&headers, CONTENT_HASH_HEADER) else {
        return bad_request("missing X-Content-Hash header");
    };
    let Some(expected_size) =
        header_str(&headers, OUTPUT_SIZE_HEADER).and_then(|v| v.parse::<u64>().ok())
    else {
        return bad_request("missing or invalid X-Output-Size header");
    };
    if expected_size == 0 {
        return bad_request("zero-byte result is never acceptable");
    }

    let target = PathBuf::from(&record.path);
    let ticket = match state.uploads.begin_stream(
        file_id,
        &query.lease,
        &target,
        query.upload.as_deref(),
        query.offset,
    ) {
        Ok(ticket) => ticket,
        Err(BeginError::Busy) => {
            let body = Json(UploadResponse {
                accepted: false,
                reason: Some("upload_in_progress".to_string()),
                ..Default::default()
            });
            return (StatusCode::CONFLICT, body).into_response();
        }
        Err(BeginError::BadOffset {
            upload_id,
            received,
        }) => {
            let body = Json(UploadResponse {
                accepted: false,
                upload_id: if upload_id.is_empty() {
                    None
                } else {
                    Some(upload_id)
                },
                received_bytes: received,
                reason: Some("offset_mismatch".to_string()),
                ..Default::default()
            });
            return (StatusCode::CONFLICT, body).into_response();
        }
        Err(BeginError::UnknownUpload) => {
            let body = Json(UploadResponse {
                accepted: false,
                reason: Some("unknown_upload".to_string()),
                ..Default::default()
            });
            return (StatusCode::CONFLICT, body).into_response();
        }
    };

    // Stream the body into the part-file at the ticket offset.
    let received = match write_body(&ticket, body).await {
        Ok(received) => received,
        Err(err) => {
            warn!(file_id, error = %err, "upload stream interrupted");
            // Whatever landed on disk counts toward the resume offset.
            let on_disk = tokio::fs::metadata(&ticket.temp_path)
                .await
                .map(|m| m.len())
                .unwrap_or(ticket.start_offset);
            state.uploads.end_stream(file_id, on_disk);
            let body = Json(UploadResponse {
                accepted: false,
                upload_id: Some(ticket.upload_id),
                received_bytes: on_disk,
                reason: Some("stream_interrupted".to_string()),
                ..Default::default()
            });
            return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
        }
    };
    state.uploads.end_stream(file_id, received);

    if received < expected_size {
        // Partial body; the worker resumes from `received`.
        let body = Json(UploadResponse {
            accepted: false,
            upload_id: Some(ticket.upload_id),
            received_bytes: received,
            ..Default::default()
        });
        return (StatusCode::OK, body).into_response();
    }
    if received > expected_size {
        if let Some(temp) = state.uploads.take(file_id) {
            let _ = tokio::fs::remove_file(temp).await;
        }
        return bad_request("received more bytes than X-Output-Size announced");
    }

    // Full body on disk: verify the digest before anything irreversible.
    let temp_path = ticket.temp_path.clone();
    let actual_hash = tokio::task::spawn_blocking(move || hash_file(&temp_path)).await;
    let actual_hash = match actual_hash {
        Ok(Ok(hash)) => hash,
        other => {
            error!(file_id, "failed to hash uploaded result: {other:?}");
            if let Some(temp) = state.uploads.take(file_id) {
                let _ = tokio::fs::remove_file(temp).await;
            }
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if actual_hash != expected_hash {
        warn!(file_id, "uploaded result failed hash verification");
        if let Some(temp) = state.uploads.take(file_id) {
            let _ = tokio::fs::remove_file(temp).await;
        }
        let body = Json(UploadResponse {
            accepted: false,
            reason: Some("hash_mismatch".to_string()),
            ..Default::default()
        });
        return (StatusCode::UNPROCESSABLE_ENTITY, body).into_response();
    }

    // Verified bytes in place: swap.
    let temp_path = state
        .uploads
        .take(file_id)
        .unwrap_or_else(|| ticket.temp_path.clone());
    let min_savings = state.config.cluster.min_savings_pct;
    let testing_mode = state.config.cluster.testing_mode;
    let swap_target = target.clone();
    let swap_temp = temp_path.clone();
    let replaced = tokio::task::spawn_blocking(move || {
        safe_replace(&swap_target, &swap_temp, min_savings, testing_mode)
    })
    .await;

    match replaced {
        Ok(Ok(report)) => {
            let commit = state
                .lifecycle
                .commit_upload(file_id, &query.lease, &report, now_ms());
            match commit {
                Ok(CompletionResult::Completed { .. })
                | Ok(CompletionResult::AlreadyCompleted) => Json(UploadResponse {
                    accepted: true,
                    saved_bytes: Some(report.savings_bytes),
                    savings_percent: Some(report.savings_percent),
                    ..Default::default()
                })
                .into_response(),
                Ok(CompletionResult::Stale) => {
                    // The assignment was reaped between verification and the
                    // swap. The bytes on disk are verified and good, but the
                    // bookkeeping lost the race; surface it loudly.
                    error!(
                        file_id,
                        "upload committed to disk but the lease went stale; \
                         record left for the operator"
                    );
                    let body = Json(UploadResponse {
                        accepted: false,
                        reason: Some("stale_lease".to_string()),
                        ..Default::default()
                    });
                    (StatusCode::CONFLICT, body).into_response()
                }
                Err(err) => {
                    error!(file_id, error = %err, "failed to record completion");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Ok(Err(ReplaceError::InsufficientSavings { .. })) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            if let Err(err) = state.lifecycle.reject_insufficient_savings(
                file_id,
                &query.lease,
                record.size_bytes,
                expected_size,
                now_ms(),
            ) {
                error!(file_id, error = %err, "failed to record savings rejection");
            }
            let body = Json(UploadResponse {
                accepted: false,
                reason: Some("output_smaller_than_threshold".to_string()),
                ..Default::default()
            });
            (StatusCode::OK, body).into_response()
        }
        Ok(Err(err)) => {
            error!(file_id, error = %err, "safe replace failed");
            if let Err(err) =
                state
                    .lifecycle
                    .fail_replace(file_id, &query.lease, &err.to_string(), now_ms())
            {
                error!(file_id, error = %err, "failed to record replace failure");
            }
            let body = Json(UploadResponse {
                accepted: false,
                reason: Some("safe_replace_failed".to_string()),
                ..Default::default()
            });
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
        Err(join) => {
            error!(file_id, error = %join, "replace task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn write_body(ticket: &StreamTicket, body: Body) -> std::io::Result<u64> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&ticket.temp_path)
        .await?;
    file.seek(SeekFrom::Start(ticket.start_offset)).await?;

    let mut written = ticket.start_offset;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bad_request(reason: &str) -> Response {
    let body = Json(UploadResponse {
        accepted: false,
        reason: Some(reason.to_string()),
        ..Default::default()
    });
    (StatusCode::BAD_REQUEST, body).into_response()
}
