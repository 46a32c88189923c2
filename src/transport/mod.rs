//! Provider transport
//!
//! Executes one signed request against a storage provider: streams the body,
//! reports byte-level progress and honors cooperative cancellation. The
//! classifier here is what keeps a user-initiated abort from ever being
//! reported as a provider failure.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::signer::SignedRequest;

/// Byte-level progress callback, called with the running total sent
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Cap on the error body kept for reporting
const ERROR_BODY_LIMIT: usize = 2048;

/// Shortens `s` to at most `max` bytes without splitting a character.
fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Bytes to send with a signed request
#[derive(Debug, Clone)]
pub enum BodySource {
    /// No body (multipart initiate, part listing, dynamic manifest commit)
    Empty,
    /// A byte range of a local file
    FileRange { path: PathBuf, range: Range<u64> },
    /// An in-memory document (completion manifests)
    Bytes(Bytes),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Client-initiated cancellation. Expected during pause/abort and never
    /// reported as a failure.
    #[error("Transfer aborted by the client")]
    Aborted,

    /// The signed URL outlived its validity window; the caller must request
    /// a fresh authorization rather than retry this request.
    #[error("Signed URL has expired")]
    SignatureExpired,

    #[error("Provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider response, body buffered
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Executes signed requests against providers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &SignedRequest,
        body: BodySource,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(
        name = "transport.execute",
        skip(self, request, body, progress, cancel),
        fields(verb = %request.verb)
    )]
    async fn execute(
        &self,
        request: &SignedRequest,
        body: BodySource,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.verb.as_bytes())
            .map_err(|_| TransportError::Network(format!("invalid verb {}", request.verb)))?;

        let mut builder = self.client.request(method, &request.url);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }

        match body {
            BodySource::Empty => {}
            BodySource::Bytes(bytes) => {
                builder = builder
                    .header(reqwest::header::CONTENT_LENGTH, bytes.len())
                    .body(bytes);
            }
            BodySource::FileRange { path, range } => {
                let len = range.end - range.start;
                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                let reader = ReaderStream::with_capacity(file.take(len), STREAM_CHUNK_SIZE);

                let sent = Arc::new(AtomicU64::new(0));
                let counted = reader.map(move |item| {
                    if let Ok(chunk) = &item {
                        let total =
                            sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
                        if let Some(cb) = &progress {
                            cb(total);
                        }
                    }
                    item
                });

                builder = builder
                    .header(reqwest::header::CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(counted));
            }
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
            result = builder.send() => result.map_err(|e| {
                // An abort tears the connection down before any response
                // headers arrive; the token is what identifies it as ours.
                if cancel.is_cancelled() {
                    TransportError::Aborted
                } else {
                    TransportError::Network(e.to_string())
                }
            })?,
        };

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
            result = response.bytes() => {
                result.map_err(|e| TransportError::Network(e.to_string()))?
            }
        };

        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&body).to_string();
            truncate_at_char_boundary(&mut message, ERROR_BODY_LIMIT);

            if status.as_u16() == 403 && message.to_ascii_lowercase().contains("expire") {
                tracing::info!(status = status.as_u16(), "Signed URL expired");
                return Err(TransportError::SignatureExpired);
            }

            tracing::warn!(status = status.as_u16(), "Provider request failed");
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}
