//! HTTP/RPC surface of the coordinator.
//!
//! A thin axum adapter over the core: handlers validate and translate, all
//! decisions live in the store, scheduler and lifecycle. Byte streams are in
//! `transfer`; everything here is JSON plus the `/events` WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use av1_farm_protocol::{
    FileStatus, HeartbeatRequest, OutcomeReport, ProgressReport, RegisterRequest, RegisterResponse,
};

use crate::events::Event;
use crate::registry::Worker;
use crate::scan::run_scan;
use crate::store::{now_ms, DailyStats, FileRecord, QueueStats, StoreError};
use crate::{transfer, SharedState};

/// Build the coordinator router. Body limits are disabled because result
/// uploads are whole media files.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/workers/register", post(register_worker))
        .route("/workers/:id/heartbeat", post(worker_heartbeat))
        .route("/workers/:id/next", post(worker_next))
        .route("/files/:id/bytes", get(transfer::download_bytes))
        .route("/files/:id/result", post(transfer::upload_result))
        .route("/files/:id/result/status", get(transfer::upload_status))
        .route("/files/:id/progress", post(file_progress))
        .route("/files/:id/report", post(file_report))
        .route("/files", get(list_files))
        .route("/status", get(status_snapshot))
        .route("/events", get(events_ws))
        .route("/config/cluster", get(cluster_config))
        .route("/admin/scan", post(admin_scan))
        .route("/admin/pause", post(admin_pause))
        .route("/admin/resume", post(admin_resume))
        .route("/admin/files/reset_failed", post(admin_reset_failed))
        .route("/admin/files/delete_completed", post(admin_delete_completed))
        .route("/admin/files/:id/reset", post(admin_file_reset))
        .route("/admin/files/:id/retry", post(admin_file_retry))
        .route("/admin/files/:id/skip", post(admin_file_skip))
        .route("/admin/files/:id/delete", post(admin_file_delete))
        .route("/admin/files/:id/priority", post(admin_file_priority))
        .route("/admin/files/:id/cancel", post(admin_file_cancel))
        .route("/admin/workers/:id/fade_out", post(admin_worker_fade_out))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Everything the UI needs in one consistent read.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub paused: bool,
    pub stats: QueueStats,
    pub workers: Vec<Worker>,
    pub files: Vec<FileRecord>,
    pub daily: Vec<DailyStats>,
}

fn build_snapshot(state: &SharedState) -> Result<StatusSnapshot, StoreError> {
    Ok(StatusSnapshot {
        paused: state.store.is_paused()?,
        stats: state.store.queue_stats()?,
        workers: state.registry.snapshot(),
        files: state.store.top_files(50)?,
        daily: state.store.daily_stats(14)?,
    })
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        err => {
            tracing::error!(error = %err, "store operation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---- worker endpoints ------------------------------------------------------

async fn register_worker(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    info!(
        worker_id = req.worker_id.as_str(),
        hostname = req.hostname.as_str(),
        version = req.version.as_str(),
        "worker registered"
    );
    state.registry.register(&req, now_ms());
    state.events.publish(Event::WorkerRegistered {
        worker_id: req.worker_id.clone(),
    });
    Json(RegisterResponse {
        accepted: true,
        config_digest: state.config.cluster.digest(),
        cluster_config: state.config.cluster.clone(),
    })
    .into_response()
}

async fn worker_heartbeat(
    State(state): State<SharedState>,
    Path(worker_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    match state.registry.heartbeat(&worker_id, &req, now_ms()) {
        // 404 tells the worker to re-register (fresh coordinator, lost
        // registry); its lease, if any, is still honored by the store.
        None => StatusCode::NOT_FOUND.into_response(),
        Some(resp) => Json(resp).into_response(),
    }
}

async fn worker_next(State(state): State<SharedState>, Path(worker_id): Path<String>) -> Response {
    match state.scheduler.next_for(&worker_id).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => {
            tracing::error!(worker_id, error = %err, "dispatch failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---- file report endpoints -------------------------------------------------

async fn file_progress(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Json(report): Json<ProgressReport>,
) -> Response {
    // Stale-lease reports are accepted by the transport and dropped by the
    // lifecycle; the worker has no action to take either way.
    match state.lifecycle.handle_progress(file_id, &report, now_ms()) {
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn file_report(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Json(report): Json<OutcomeReport>,
) -> Response {
    match state.lifecycle.handle_report(file_id, &report, now_ms()) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => store_error(err),
    }
}

// ---- read endpoints --------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListFilesQuery {
    status: Option<String>,
}

async fn list_files(
    State(state): State<SharedState>,
    Query(query): Query<ListFilesQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match FileStatus::parse(raw) {
            Some(status) => Some(status),
            None => return StatusCode::BAD_REQUEST.into_response(),
        },
    };
    match state.store.files(status) {
        Ok(files) => Json(files).into_response(),
        Err(err) => store_error(err),
    }
}

async fn status_snapshot(State(state): State<SharedState>) -> Response {
    match build_snapshot(&state) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => store_error(err),
    }
}

async fn cluster_config(State(state): State<SharedState>) -> Response {
    Json(json!({
        "config_digest": state.config.cluster.digest(),
        "cluster_config": state.config.cluster,
    }))
    .into_response()
}

// ---- event stream ----------------------------------------------------------

async fn events_ws(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| events_socket(state, socket))
}

/// Snapshot first, then the live stream. A subscriber that lags past the
/// bus backlog is disconnected and must resubscribe for a fresh snapshot.
async fn events_socket(state: SharedState, mut socket: WebSocket) {
    // Subscribe before snapshotting so nothing falls between the two.
    let mut rx = state.events.subscribe();

    let snapshot = match build_snapshot(&state) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::error!(error = %err, "failed to build event snapshot");
            return;
        }
    };
    let greeting = json!({ "event": "snapshot", "data": snapshot }).to_string();
    if socket.send(Message::Text(greeting)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "event subscriber lagged, disconnecting");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {} // pings and client chatter are ignored
                _ => break,
            },
        }
    }
}

// ---- admin endpoints -------------------------------------------------------

async fn admin_scan(State(state): State<SharedState>) -> Response {
    let scan_state = state.clone();
    let result =
        tokio::task::spawn_blocking(move || {
            run_scan(&scan_state.store, &scan_state.config.library_roots)
        })
        .await;
    match result {
        Ok(Ok(summary)) => {
            state.events.publish(Event::ScanCompleted {
                added: summary.added,
                updated: summary.updated + summary.requeued,
            });
            Json(json!({
                "added": summary.added,
                "updated": summary.updated + summary.requeued,
            }))
            .into_response()
        }
        Ok(Err(err)) => store_error(err),
        Err(err) => {
            tracing::error!(error = %err, "scan task panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn admin_pause(State(state): State<SharedState>) -> Response {
    match state.store.set_paused(true) {
        Ok(()) => Json(json!({ "paused": true })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn admin_resume(State(state): State<SharedState>) -> Response {
    match state.store.set_paused(false) {
        Ok(()) => Json(json!({ "paused": false })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn admin_reset_failed(State(state): State<SharedState>) -> Response {
    match state.store.bulk_reset_failed(now_ms()) {
        Ok(count) => Json(json!({ "reset": count })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn admin_delete_completed(State(state): State<SharedState>) -> Response {
    match state.store.bulk_delete_completed() {
        Ok(count) => Json(json!({ "deleted": count })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn admin_file_reset(State(state): State<SharedState>, Path(file_id): Path<i64>) -> Response {
    let _ = state.lifecycle.request_cancel(file_id);
    match state.store.reset_file(file_id, now_ms()) {
        Ok(record) => {
            state.events.publish(Event::state_changed(&record));
            Json(record).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn admin_file_retry(State(state): State<SharedState>, Path(file_id): Path<i64>) -> Response {
    let _ = state.lifecycle.request_cancel(file_id);
    match state.store.retry_file(file_id, now_ms()) {
        Ok(record) => {
            state.events.publish(Event::state_changed(&record));
            Json(record).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn admin_file_skip(State(state): State<SharedState>, Path(file_id): Path<i64>) -> Response {
    let _ = state.lifecycle.request_cancel(file_id);
    match state
        .store
        .record_skip(file_id, None, "operator", "Manually skipped", now_ms())
    {
        Ok(_) => match state.store.file(file_id) {
            Ok(Some(record)) => {
                state.events.publish(Event::state_changed(&record));
                Json(record).into_response()
            }
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(err) => store_error(err),
        },
        Err(err) => store_error(err),
    }
}

async fn admin_file_delete(State(state): State<SharedState>, Path(file_id): Path<i64>) -> Response {
    let _ = state.lifecycle.request_cancel(file_id);
    match state.store.delete_file(file_id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct PriorityRequest {
    priority: i32,
    preferred_worker_id: Option<String>,
}

async fn admin_file_priority(
    State(state): State<SharedState>,
    Path(file_id): Path<i64>,
    Json(req): Json<PriorityRequest>,
) -> Response {
    match state.store.set_priority(
        file_id,
        req.priority,
        req.preferred_worker_id.as_deref(),
        now_ms(),
    ) {
        Ok(record) => Json(record).into_response(),
        Err(err) => store_error(err),
    }
}

async fn admin_file_cancel(State(state): State<SharedState>, Path(file_id): Path<i64>) -> Response {
    match state.lifecycle.request_cancel(file_id) {
        Ok(queued) => Json(json!({ "cancel_queued": queued })).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct FadeOutRequest {
    fade_out: bool,
}

async fn admin_worker_fade_out(
    State(state): State<SharedState>,
    Path(worker_id): Path<String>,
    Json(req): Json<FadeOutRequest>,
) -> Response {
    match state.registry.set_fade_out(&worker_id, req.fade_out) {
        Some(fade_out) => {
            state.events.publish(Event::WorkerFadeOut {
                worker_id,
                fade_out,
            });
            Json(json!({ "fade_out": fade_out })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::transfer::{CONTENT_HASH_HEADER, OUTPUT_SIZE_HEADER};
    use crate::AppState;
    use av1_farm_config::CoordinatorConfig;
    use av1_farm_protocol::{NextResponse, UploadResponse, WorkerCapabilities};
    use axum::body::Body;
    use axum::http::Request;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(library_root: &std::path::Path) -> SharedState {
        let mut config = CoordinatorConfig::default();
        config.library_roots = vec![library_root.to_path_buf()];
        let store = Arc::new(Store::open_in_memory().unwrap());
        AppState::with_store(config, store)
    }

    async fn send_json(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    fn register_body(worker_id: &str) -> serde_json::Value {
        serde_json::to_value(RegisterRequest {
            worker_id: worker_id.to_string(),
            display_name: worker_id.to_string(),
            hostname: "encoder-box".to_string(),
            version: "0.1.0".to_string(),
            capabilities: WorkerCapabilities {
                cpu_count: 8,
                memory_total: 32 << 30,
                encoder_presets: vec![8],
                supports_file_distribution: true,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_returns_cluster_config_and_digest() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let router = router(state.clone());

        let (status, body) = send_json(
            &router,
            "POST",
            "/workers/register",
            Some(register_body("w1")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert_eq!(body["config_digest"], state.config.cluster.digest());
        assert_eq!(body["cluster_config"]["max_attempts"], 3);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker_is_404() {
        let dir = TempDir::new().unwrap();
        let router = router(test_state(dir.path()));

        let (status, _) = send_json(
            &router,
            "POST",
            "/workers/ghost/heartbeat",
            Some(serde_json::json!({ "cpu_percent": 1.0, "memory_percent": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_next_without_work() {
        let dir = TempDir::new().unwrap();
        let router = router(test_state(dir.path()));

        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;
        let (status, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["no_work"], true);
    }

    #[tokio::test]
    async fn test_end_to_end_happy_path() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("a.mkv");
        let source_bytes: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&media, &source_bytes).unwrap();

        let state = test_state(dir.path());
        let router = router(state.clone());

        // Scan finds the file.
        let (status, body) = send_json(&router, "POST", "/admin/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], 1);

        // Register and request work.
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;
        let (_, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        let next: NextResponse = serde_json::from_value(body).unwrap();
        let assignment = next.assignment.expect("should hand out the scanned file");
        assert_eq!(assignment.size_bytes, 1000);
        let lease = assignment.lease_token.clone();
        let file_id = assignment.file_id;

        // Download the source and verify the advertised hash.
        let request = Request::builder()
            .method("GET")
            .uri(format!("/files/{file_id}/bytes?lease={lease}"))
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let advertised = response
            .headers()
            .get(CONTENT_HASH_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let downloaded = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(downloaded.as_ref(), source_bytes.as_slice());
        assert_eq!(advertised, blake3::hash(&source_bytes).to_hex().to_string());

        // Upload a 400-byte "encode" (60% savings).
        let output_bytes = vec![7u8; 400];
        let output_hash = blake3::hash(&output_bytes).to_hex().to_string();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/files/{file_id}/result?lease={lease}"))
            .header(CONTENT_HASH_HEADER, &output_hash)
            .header(OUTPUT_SIZE_HEADER, "400")
            .body(Body::from(output_bytes.clone()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let upload: UploadResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(upload.accepted);
        assert_eq!(upload.saved_bytes, Some(600));
        assert!((upload.savings_percent.unwrap() - 60.0).abs() < 0.001);

        // The swap happened: new bytes at the path, original in the backup
        // (default cluster config runs in testing mode).
        assert_eq!(fs::read(&media).unwrap(), output_bytes);
        let backup = crate::safe_replace::backup_path(&media);
        assert_eq!(fs::read(&backup).unwrap(), source_bytes);

        // And the record reads completed with the right savings.
        let record = state.store.file(file_id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Completed);
        assert_eq!(record.output_size_bytes, Some(400));
        assert!((record.savings_percent.unwrap() - 60.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_upload_with_insufficient_savings_skips_file() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("a.mkv");
        let source_bytes = vec![3u8; 1000];
        fs::write(&media, &source_bytes).unwrap();

        let state = test_state(dir.path());
        let router = router(state.clone());

        send_json(&router, "POST", "/admin/scan", None).await;
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;
        let (_, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        let next: NextResponse = serde_json::from_value(body).unwrap();
        let assignment = next.assignment.unwrap();

        // 97% of the source misses the 5% floor.
        let output_bytes = vec![9u8; 970];
        let output_hash = blake3::hash(&output_bytes).to_hex().to_string();
        let request = Request::builder()
            .method("POST")
            .uri(format!(
                "/files/{}/result?lease={}",
                assignment.file_id, assignment.lease_token
            ))
            .header(CONTENT_HASH_HEADER, &output_hash)
            .header(OUTPUT_SIZE_HEADER, "970")
            .body(Body::from(output_bytes))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let upload: UploadResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!upload.accepted);
        assert_eq!(
            upload.reason.as_deref(),
            Some("output_smaller_than_threshold")
        );

        // Original untouched, no backup, record terminally skipped.
        assert_eq!(fs::read(&media).unwrap(), source_bytes);
        assert!(!crate::safe_replace::backup_path(&media).exists());
        let record = state.store.file(assignment.file_id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Skipped);
    }

    #[tokio::test]
    async fn test_download_with_stale_lease_is_409() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("a.mkv");
        fs::write(&media, vec![1u8; 100]).unwrap();

        let state = test_state(dir.path());
        let router = router(state.clone());

        send_json(&router, "POST", "/admin/scan", None).await;
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;
        let (_, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        let next: NextResponse = serde_json::from_value(body).unwrap();
        let file_id = next.assignment.unwrap().file_id;

        let request = Request::builder()
            .method("GET")
            .uri(format!("/files/{file_id}/bytes?lease=wrong-lease"))
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_pause_blocks_dispatch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mkv"), vec![1u8; 100]).unwrap();
        let state = test_state(dir.path());
        let router = router(state.clone());

        send_json(&router, "POST", "/admin/scan", None).await;
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;

        let (status, body) = send_json(&router, "POST", "/admin/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);

        let (_, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        assert_eq!(body["no_work"], true);

        send_json(&router, "POST", "/admin/resume", None).await;
        let (_, body) = send_json(&router, "POST", "/workers/w1/next", None).await;
        assert!(body["assignment"].is_object());
    }

    #[tokio::test]
    async fn test_admin_priority_pins_and_revives() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mkv"), vec![1u8; 100]).unwrap();
        let state = test_state(dir.path());
        let router = router(state.clone());
        send_json(&router, "POST", "/admin/scan", None).await;
        let file_id = state.store.files(None).unwrap()[0].id;

        let (status, body) = send_json(
            &router,
            "POST",
            &format!("/admin/files/{file_id}/priority"),
            Some(serde_json::json!({ "priority": 9, "preferred_worker_id": "w_slow" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priority"], 9);
        assert_eq!(body["preferred_worker_id"], "w_slow");
    }

    #[tokio::test]
    async fn test_fade_out_endpoint() {
        let dir = TempDir::new().unwrap();
        let router = router(test_state(dir.path()));
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;

        let (status, body) = send_json(
            &router,
            "POST",
            "/admin/workers/w1/fade_out",
            Some(serde_json::json!({ "fade_out": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fade_out"], true);

        let (status, _) = send_json(
            &router,
            "POST",
            "/admin/workers/ghost/fade_out",
            Some(serde_json::json!({ "fade_out": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_snapshot_shape() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mkv"), vec![1u8; 100]).unwrap();
        let router = router(test_state(dir.path()));
        send_json(&router, "POST", "/admin/scan", None).await;
        send_json(&router, "POST", "/workers/register", Some(register_body("w1"))).await;

        let (status, body) = send_json(&router, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], false);
        assert_eq!(body["stats"]["total_files"], 1);
        assert_eq!(body["workers"].as_array().unwrap().len(), 1);
        assert_eq!(body["files"].as_array().unwrap().len(), 1);
    }
}
