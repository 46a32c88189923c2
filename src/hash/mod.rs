//! Content hashing
//!
//! Computes the MD5 content identifier used as an idempotency key and, for
//! most providers, as an integrity header. Hashing runs off the async
//! executor and is cancellable between blocks.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Block size for streaming reads (1MB)
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Hashing errors
#[derive(Error, Debug)]
pub enum HashError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Hashing cancelled")]
    Cancelled,

    #[error("Invalid byte range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },
}

/// MD5 digest of a byte range.
///
/// Providers disagree on the wire encoding: S3 ETags and Swift segment ETags
/// are the hex form, `Content-Md5` headers want base64. Both are derived
/// from the same digest here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentId([u8; 16]);

impl ContentId {
    pub fn from_digest(digest: [u8; 16]) -> Self {
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

/// Hashing collaborator for the upload session.
///
/// Must be invoked exactly once per chunk per attempt. A network retry of an
/// already-hashed chunk reuses the previous `ContentId`.
#[async_trait]
pub trait HashService: Send + Sync {
    /// Hash exactly `range` of the file at `source`.
    async fn hash_range(
        &self,
        source: &Path,
        range: Range<u64>,
        cancel: &CancellationToken,
    ) -> Result<ContentId, HashError>;
}

/// Streaming MD5 hasher reading the file in 1MB blocks on a blocking thread.
pub struct Md5HashService;

#[async_trait]
impl HashService for Md5HashService {
    async fn hash_range(
        &self,
        source: &Path,
        range: Range<u64>,
        cancel: &CancellationToken,
    ) -> Result<ContentId, HashError> {
        if range.start > range.end {
            return Err(HashError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }

        let path: PathBuf = source.to_path_buf();
        let token = cancel.clone();

        tokio::task::spawn_blocking(move || hash_file_range(&path, range, &token))
            .await
            .map_err(|e| HashError::IoError(std::io::Error::other(e)))?
    }
}

fn hash_file_range(
    path: &Path,
    range: Range<u64>,
    cancel: &CancellationToken,
) -> Result<ContentId, HashError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;

    let mut remaining = range.end - range.start;
    let mut context = md5::Context::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];

    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(HashError::Cancelled);
        }

        let want = remaining.min(HASH_BLOCK_SIZE as u64) as usize;
        let read = file.read(&mut block[..want])?;
        if read == 0 {
            // File shorter than the declared range
            return Err(HashError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        context.consume(&block[..read]);
        remaining -= read as u64;
    }

    Ok(ContentId::from_digest(context.compute().0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_hash_whole_file() {
        // md5("hello world") = 5eb63bbbe01eeed093cb22bb8f5acdc3
        let f = temp_file(b"hello world");
        let id = Md5HashService
            .hash_range(f.path(), 0..11, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_hash_sub_range() {
        let f = temp_file(b"xxhello worldxx");
        let id = Md5HashService
            .hash_range(f.path(), 2..13, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_base64_matches_hex() {
        let f = temp_file(b"hello world");
        let id = Md5HashService
            .hash_range(f.path(), 0..11, &CancellationToken::new())
            .await
            .unwrap();
        // base64 of the raw digest, not of the hex string
        assert_eq!(id.to_base64(), "XrY7u+Ae7tCTyyK7j1rNww==");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = temp_file(&vec![0u8; 4096]);
        let token = CancellationToken::new();
        token.cancel();
        let result = Md5HashService.hash_range(f.path(), 0..4096, &token).await;
        assert!(matches!(result, Err(HashError::Cancelled)));
    }

    #[tokio::test]
    async fn test_range_past_eof() {
        let f = temp_file(b"short");
        let result = Md5HashService
            .hash_range(f.path(), 0..100, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HashError::InvalidRange { .. })));
    }
}
