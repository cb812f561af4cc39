//!
//! quillhub image relay
//! --------------------
//! Moves a client upload to the external image host:
//!
//! 1. stream the payload into a uniquely named file under the upload dir
//!    (`create_new`, never overwrites);
//! 2. re-read that file and POST it as multipart (`smfile`, `format=json`,
//!    `Authorization` header), one attempt bounded by the relay timeout;
//! 3. delete the file before returning, whatever happened in step 2.
//!
//! If step 1 fails nothing is sent. Every failure comes back as a
//! `RelayOutcome` with `status: Failure`; `relay` itself never errors.
//!
//! The file is owned by a `TransientFile` guard, removed exactly once by
//! `TransientFile::remove`, with `Drop` as the fallback when the relay future is
//! dropped mid-flight. A failed removal is logged and does not change the outcome.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const DEFAULT_IMAGE_HOST_URL: &str = "https://sm.ms/api/v2/upload";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to save! {0}")]
    LocalPersist(#[from] io::Error),
    #[error("Failed to save! upload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("could not read back the saved upload: {0}")]
    ReadBack(io::Error),
    #[error("image host unreachable: {0}")]
    Transport(String),
    #[error("image host did not answer within {0:?}")]
    Timeout(Duration),
    #[error("image host rejected the upload: {0}")]
    Rejected(String),
}

impl RelayError {
    /// True for failures that happened before anything was sent.
    pub fn is_local(&self) -> bool { matches!(self, RelayError::LocalPersist(_) | RelayError::TooLarge { .. }) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Success,
    Failure,
}

/// Result value of a relay; `res` holds the host's raw response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayOutcome {
    pub status: RelayStatus,
    pub message: String,
    pub res: String,
}

impl RelayOutcome {
    pub fn success(body: String) -> Self {
        Self { status: RelayStatus::Success, message: "success".into(), res: body }
    }

    pub fn failure(err: &RelayError) -> Self {
        Self { status: RelayStatus::Failure, message: err.to_string(), res: String::new() }
    }

    pub fn is_success(&self) -> bool { self.status == RelayStatus::Success }
}

/// What the image host answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    pub status: u16,
    pub body: String,
}

impl HostResponse {
    /// A non-2xx status, or a JSON body with `"success": false`, is a rejection.
    pub fn into_result(self) -> Result<String, RelayError> {
        if !(200..300).contains(&self.status) {
            return Err(RelayError::Rejected(format!("HTTP {}: {}", self.status, self.body)));
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&self.body) {
            if v.get("success").and_then(|s| s.as_bool()) == Some(false) {
                let msg = v.get("message").and_then(|m| m.as_str()).unwrap_or("upload refused");
                return Err(RelayError::Rejected(msg.to_string()));
            }
        }
        Ok(self.body)
    }
}

/// The remote image host. One call is one attempt.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn upload(&self, payload: Vec<u8>, filename: &str, mime_type: &str) -> Result<HostResponse, RelayError>;
}

/// sm.ms-compatible host: multipart POST with `smfile` and `format=json`.
#[derive(Debug, Clone)]
pub struct SmmsHost {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl SmmsHost {
    pub fn new<E: Into<String>, T: Into<String>>(endpoint: E, token: T) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into(), token: token.into() }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl ImageHost for SmmsHost {
    async fn upload(&self, payload: Vec<u8>, filename: &str, mime_type: &str) -> Result<HostResponse, RelayError> {
        let mime = if mime_type.trim().is_empty() { "application/octet-stream" } else { mime_type.trim() };
        let part = reqwest::multipart::Part::bytes(payload)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| RelayError::Transport(format!("invalid mime type '{}': {}", mime, e)))?;
        let form = reqwest::multipart::Form::new()
            .part("smfile", part)
            .text("format", "json");
        let resp = self.client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(HostResponse { status, body })
    }
}

/// A local file that must not outlive its upload job.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
    armed: bool,
}

impl TransientFile {
    fn new(path: PathBuf) -> Self { Self { path, armed: true } }

    pub fn path(&self) -> &Path { &self.path }

    /// Delete the file. Returns false when removal failed (logged, not propagated).
    pub async fn remove(mut self) -> bool {
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(target: "relay", path = %self.path.display(), "transient file removed");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(target: "relay", path = %self.path.display(), error = %e, "transient file cleanup failed");
                false
            }
        }
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if !self.armed { return; }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(target: "relay", path = %self.path.display(), "transient file removed on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "relay", path = %self.path.display(), error = %e, "transient file cleanup failed"),
        }
    }
}

/// Keep the last path component and a conservative character set.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() { "upload".to_string() } else { cleaned }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upload_dir: PathBuf,
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl RelayConfig {
    pub fn new<P: Into<PathBuf>>(upload_dir: P) -> Self {
        Self { upload_dir: upload_dir.into(), timeout: Duration::from_secs(30), max_bytes: DEFAULT_MAX_UPLOAD_BYTES }
    }
}

pub struct UploadRelay {
    config: RelayConfig,
    host: Arc<dyn ImageHost>,
}

impl UploadRelay {
    pub fn new(config: RelayConfig, host: Arc<dyn ImageHost>) -> Self { Self { config, host } }

    pub fn config(&self) -> &RelayConfig { &self.config }

    /// Persist, forward, clean up. See the module docs for the ordering contract.
    pub async fn relay<S>(&self, stream: S, mime_type: &str, filename: &str) -> RelayOutcome
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let filename = sanitize_filename(filename);
        let transient = match self.persist(stream, &filename).await {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "relay", file = %filename, error = %e, "local persist failed, nothing forwarded");
                return RelayOutcome::failure(&e);
            }
        };
        let forwarded = self.forward(transient.path(), &filename, mime_type).await;
        transient.remove().await;
        match forwarded {
            Ok(body) => {
                info!(target: "relay", file = %filename, "upload relayed");
                RelayOutcome::success(body)
            }
            Err(e) => {
                warn!(target: "relay", file = %filename, error = %e, "upload relay failed");
                RelayOutcome::failure(&e)
            }
        }
    }

    async fn persist<S>(&self, stream: S, filename: &str) -> Result<TransientFile, RelayError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        tokio::fs::create_dir_all(&self.config.upload_dir).await?;
        let path = self.config.upload_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), filename));
        let mut file = tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await?;
        let transient = TransientFile::new(path);
        let written = write_stream(&mut file, stream, self.config.max_bytes).await;
        drop(file);
        match written {
            Ok(n) => {
                debug!(target: "relay", path = %transient.path().display(), bytes = n, "upload persisted");
                Ok(transient)
            }
            Err(e) => {
                transient.remove().await;
                Err(e)
            }
        }
    }

    async fn forward(&self, path: &Path, filename: &str, mime_type: &str) -> Result<String, RelayError> {
        let payload = tokio::fs::read(path).await.map_err(RelayError::ReadBack)?;
        match tokio::time::timeout(self.config.timeout, self.host.upload(payload, filename, mime_type)).await {
            Ok(resp) => resp?.into_result(),
            Err(_) => Err(RelayError::Timeout(self.config.timeout)),
        }
    }
}

async fn write_stream<S>(file: &mut tokio::fs::File, stream: S, limit: u64) -> Result<u64, RelayError>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(RelayError::TooLarge { limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}
