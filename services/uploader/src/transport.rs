//! Wire side of the resumable upload protocol.
//!
//! The uploader only sees [`UploadTransport`]; the HTTP implementation and the
//! local dry-run sink sit behind it.

use crate::config::{AccountConfig, ApiConfig};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    #[error("request error: {0}")]
    Request(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the failed request is worth repeating.
    ///
    /// Connection problems, timeouts and 5xx responses are. A 4xx is only
    /// when its JSON body sets `retriable: true`.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::Timeout => true,
            TransportError::Status { status, body } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    return true;
                }
                status.is_client_error() && body_marks_retriable(body)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() || e.is_request() {
            TransportError::Connection(e.to_string())
        } else if e.is_decode() {
            TransportError::MalformedResponse(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

fn body_marks_retriable(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    ["/debug_info/retriable", "/retriable"]
        .iter()
        .any(|pointer| value.pointer(pointer).and_then(|v| v.as_bool()) == Some(true))
}

/// One byte range of an archive.
///
/// An empty `data` marks the end of the stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub session_key: String,
    pub offset: u64,
    pub total_size: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn is_final(&self) -> bool {
        self.data.is_empty()
    }

    /// `Content-Range` header value
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.offset, self.total_size, self.total_size)
    }
}

/// What the server said about an accepted chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkReceipt {
    /// Content hash confirmed by the server, present on the final response
    pub hash: Option<String>,
}

/// Server side of a resumable upload session.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Bytes of `session_key` the server has already stored.
    async fn fetch_offset(&self, session_key: &str) -> Result<u64, TransportError>;

    /// Send one chunk.
    async fn send_chunk(&self, chunk: Chunk) -> Result<ChunkReceipt, TransportError>;
}

#[derive(Deserialize)]
struct OffsetResponse {
    #[serde(rename = "totalChunkUploaded")]
    total_chunk_uploaded: u64,
}

#[derive(Deserialize)]
struct FinalResponse {
    hash: Option<String>,
}

/// Talks to the upload endpoint over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    account: AccountConfig,
}

impl HttpTransport {
    pub fn new(api: &ApiConfig, account: AccountConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: api.upload_endpoint.clone(),
            account,
        })
    }
}

/// Turn a non-success response into a [`TransportError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn fetch_offset(&self, session_key: &str) -> Result<u64, TransportError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("fileName", session_key), ("email", self.account.email.as_str())])
            .header(AUTHORIZATION, format!("OAuth {}", self.account.token))
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: OffsetResponse = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        debug!(session_key = %session_key, offset = body.total_chunk_uploaded, "Fetched upload offset");
        Ok(body.total_chunk_uploaded)
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<ChunkReceipt, TransportError> {
        let content_range = chunk.content_range();
        let part = Part::bytes(chunk.data.to_vec()).file_name(chunk.session_key.clone());
        let form = Form::new().part("chunk", part);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Range", content_range)
            .header("X-File-Id", chunk.session_key.as_str())
            .header("email", self.account.email.as_str());
        if let Some(key) = &self.account.organization_key {
            request = request.header("project-organization-key", key.as_str());
        }
        if let Some(key) = &self.account.project_key {
            request = request.header("project-key", key.as_str());
        }

        let response = check_status(request.multipart(form).send().await?).await?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with("application/json"));
        if response.status() == StatusCode::NO_CONTENT || !is_json {
            return Ok(ChunkReceipt::default());
        }

        let body: FinalResponse = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        Ok(ChunkReceipt { hash: body.hash })
    }
}

/// Appends chunks to `<dir>/<session_key>` instead of uploading them.
///
/// The local file size is the resume offset and the session key stands in
/// for the server hash.
pub struct DryRunTransport {
    dir: PathBuf,
}

impl DryRunTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn target(&self, session_key: &str) -> PathBuf {
        self.dir.join(session_key)
    }
}

#[async_trait]
impl UploadTransport for DryRunTransport {
    async fn fetch_offset(&self, session_key: &str) -> Result<u64, TransportError> {
        match tokio::fs::metadata(self.target(session_key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_chunk(&self, chunk: Chunk) -> Result<ChunkReceipt, TransportError> {
        if chunk.is_final() {
            return Ok(ChunkReceipt {
                hash: Some(chunk.session_key),
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.target(&chunk.session_key))
            .await?;
        file.write_all(&chunk.data).await?;
        file.flush().await?;
        Ok(ChunkReceipt::default())
    }
}
