//! HTTP client for the coordinator's RPC surface.
//!
//! Thin wrapper over `reqwest`: JSON for control messages, raw streams for
//! the byte transfers. Downloads resume from whatever landed on disk and are
//! verified against the assignment's blake3 digest; uploads resume through
//! the upload-id the coordinator issues, with a status probe for the case
//! where the response carrying it was lost.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use av1_farm_protocol::{
    Assignment, HeartbeatRequest, HeartbeatResponse, NextResponse, OutcomeReport, ProgressReport,
    RegisterRequest, RegisterResponse, UploadResponse,
};

/// Header carrying the blake3 hex digest of the transferred bytes.
const CONTENT_HASH_HEADER: &str = "x-content-hash";
/// Header carrying the total expected size of an uploaded result.
const OUTPUT_SIZE_HEADER: &str = "x-output-size";

/// Transfer attempts (initial try plus resumes) before giving up.
const TRANSFER_ATTEMPTS: usize = 4;

/// Error type for coordinator calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or protocol error from the HTTP layer.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The coordinator refused the call.
    #[error("coordinator rejected the request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// The lease on this assignment is no longer current.
    #[error("lease is stale")]
    StaleLease,

    /// Downloaded bytes do not match the announced digest.
    #[error("content hash mismatch after download")]
    HashMismatch,

    /// Local file IO while staging a transfer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base: String,
    worker_id: String,
}

impl CoordinatorClient {
    pub fn new(base_url: &str, worker_id: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// `POST /workers/register`
    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/workers/register"))
            .json(req)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// `POST /workers/{id}/heartbeat`. `Ok(None)` means the coordinator does
    /// not know this worker (fresh restart) and a re-registration is due.
    pub async fn heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> Result<Option<HeartbeatResponse>, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{}/heartbeat", self.worker_id)))
            .json(req)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(Some(response.json().await?))
    }

    /// `POST /workers/{id}/next`
    pub async fn next(&self) -> Result<NextResponse, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{}/next", self.worker_id)))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json().await?)
    }

    /// `POST /files/{id}/progress`. Best effort; the caller decides whether
    /// a failed report matters.
    pub async fn report_progress(
        &self,
        file_id: i64,
        report: &ProgressReport,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/files/{file_id}/progress")))
            .json(report)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }

    /// `POST /files/{id}/report`
    pub async fn report_outcome(
        &self,
        file_id: i64,
        report: &OutcomeReport,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/files/{file_id}/report")))
            .json(report)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }

    /// Download the assigned source into `dest`, resuming from whatever a
    /// previous attempt already wrote, and verify the digest end to end.
    pub async fn download(&self, assignment: &Assignment, dest: &Path) -> Result<(), ClientError> {
        for attempt in 1..=TRANSFER_ATTEMPTS {
            let offset = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);
            if offset < assignment.size_bytes {
                match self.download_range(assignment, dest, offset).await {
                    Ok(()) => {}
                    Err(ClientError::StaleLease) => return Err(ClientError::StaleLease),
                    Err(err) if attempt < TRANSFER_ATTEMPTS => {
                        warn!(
                            file_id = assignment.file_id,
                            attempt,
                            error = %err,
                            "download interrupted, resuming"
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            // Full length on disk: verify the whole file against the digest
            // the assignment announced.
            let path = dest.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || hash_file(&path))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
            if actual == assignment.content_hash {
                return Ok(());
            }

            // Corrupt bytes on disk; start over from zero.
            warn!(
                file_id = assignment.file_id,
                attempt, "download hash mismatch, restarting"
            );
            let _ = tokio::fs::remove_file(dest).await;
            if attempt == TRANSFER_ATTEMPTS {
                return Err(ClientError::HashMismatch);
            }
        }
        Err(ClientError::HashMismatch)
    }

    async fn download_range(
        &self,
        assignment: &Assignment,
        dest: &Path,
        offset: u64,
    ) -> Result<(), ClientError> {
        let offset_param = offset.to_string();
        let response = self
            .http
            .get(self.url(&format!("/files/{}/bytes", assignment.file_id)))
            .query(&[
                ("lease", assignment.lease_token.as_str()),
                ("offset", offset_param.as_str()),
            ])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::StaleLease);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(dest)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Upload the encoded result, resuming through the coordinator's upload
    /// id after interruptions. Returns the coordinator's verdict; a rejected
    /// upload is a normal answer here, not an error.
    pub async fn upload(
        &self,
        file_id: i64,
        lease: &str,
        path: &Path,
        output_size: u64,
        content_hash: &str,
    ) -> Result<UploadResponse, ClientError> {
        let mut upload_id: Option<String> = None;
        let mut offset: u64 = 0;

        for attempt in 1..=TRANSFER_ATTEMPTS {
            match self
                .upload_from(file_id, lease, path, output_size, content_hash, upload_id.as_deref(), offset)
                .await
            {
                Ok(response) if response.accepted => return Ok(response),
                Ok(response) => {
                    // Partial receipt: the coordinator tells us where to
                    // continue. Anything else is a verdict for the caller.
                    let resumable = matches!(
                        response.reason.as_deref(),
                        None | Some("stream_interrupted")
                    );
                    if resumable
                        && response.upload_id.is_some()
                        && response.received_bytes < output_size
                    {
                        upload_id = response.upload_id.clone();
                        offset = response.received_bytes;
                        continue;
                    }
                    return Ok(response);
                }
                Err(ClientError::StaleLease) => return Err(ClientError::StaleLease),
                Err(err) if attempt < TRANSFER_ATTEMPTS => {
                    warn!(file_id, attempt, error = %err, "upload interrupted, probing resume point");
                    match self.upload_point(file_id, lease).await {
                        Ok((id, received)) => {
                            upload_id = id;
                            offset = received;
                        }
                        Err(probe_err) => {
                            debug!(file_id, error = %probe_err, "resume probe failed, restarting");
                            upload_id = None;
                            offset = 0;
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::Rejected {
            status: 0,
            reason: "upload attempts exhausted".to_string(),
        })
    }

    async fn upload_from(
        &self,
        file_id: i64,
        lease: &str,
        path: &Path,
        output_size: u64,
        content_hash: &str,
        upload_id: Option<&str>,
        offset: u64,
    ) -> Result<UploadResponse, ClientError> {
        let mut file = tokio::fs::File::open(path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut query: Vec<(&str, String)> = vec![
            ("lease", lease.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(upload_id) = upload_id {
            query.push(("upload", upload_id.to_string()));
        }

        let response = self
            .http
            .post(self.url(&format!("/files/{file_id}/result")))
            .query(&query)
            .header(CONTENT_HASH_HEADER, content_hash)
            .header(OUTPUT_SIZE_HEADER, output_size.to_string())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let verdict: UploadResponse = response.json().await.unwrap_or_default();
            if verdict.reason.as_deref() == Some("stale_lease") {
                return Err(ClientError::StaleLease);
            }
            return Ok(verdict);
        }
        if status.is_success()
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            || status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        {
            // These all carry a structured verdict body.
            return Ok(response.json().await?);
        }
        Err(rejected(response).await)
    }

    /// `GET /files/{id}/result/status`: where to resume after a lost response.
    async fn upload_point(
        &self,
        file_id: i64,
        lease: &str,
    ) -> Result<(Option<String>, u64), ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/files/{file_id}/result/status")))
            .query(&[("lease", lease)])
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::StaleLease);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let status: UploadResponse = response.json().await?;
        Ok((status.upload_id, status.received_bytes))
    }
}

async fn rejected(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let reason = response
        .text()
        .await
        .unwrap_or_else(|_| "unreadable error body".to_string());
    ClientError::Rejected { status, reason }
}

/// Blake3 hex digest of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = CoordinatorClient::new("http://coordinator:8090/", "w1").unwrap();
        assert_eq!(client.url("/workers/w1/next"), "http://coordinator:8090/workers/w1/next");

        let client = CoordinatorClient::new("http://coordinator:8090", "w1").unwrap();
        assert_eq!(client.url("/status"), "http://coordinator:8090/status");
    }

    #[test]
    fn test_hash_file_matches_blake3() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"tiny test payload").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            blake3::hash(b"tiny test payload").to_hex().to_string()
        );
    }
}
