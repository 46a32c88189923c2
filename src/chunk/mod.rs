//! Chunk planning
//!
//! Decides the chunk size for a file against a provider's limits and maps
//! part numbers to byte ranges. Part numbers are 1-based; ranges are
//! contiguous, non-overlapping and cover exactly `[0, file_size)`.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Planning errors
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("File too large: {file_size} bytes cannot fit in {max_parts} parts of at most {max_chunk_size} bytes")]
    FileTooLarge {
        file_size: u64,
        max_parts: u64,
        max_chunk_size: u64,
    },

    #[error("File is empty")]
    EmptyFile,
}

/// Per-provider upload limits. Configuration, not protocol: the session
/// consults this table rather than hard-coding thresholds per call site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Files at or below this size use a single direct request
    pub direct_limit: u64,
    /// Nominal chunk size, only ever enlarged
    pub default_chunk_size: u64,
    /// Provider cap on the number of parts
    pub max_parts: u64,
    /// Provider cap on the size of a single part
    pub max_chunk_size: u64,
}

pub const MIB: u64 = 1024 * 1024;

impl ProviderLimits {
    /// Amazon S3 and compatible stores: 5MB minimum part, 10,000 parts, 5GB cap
    pub fn amazon_s3() -> Self {
        Self {
            direct_limit: 5 * MIB,
            default_chunk_size: 5 * MIB,
            max_parts: 10_000,
            max_chunk_size: 5 * 1024 * MIB,
        }
    }

    /// Google Cloud Storage signs direct uploads only
    pub fn google_cloud() -> Self {
        Self {
            direct_limit: u64::MAX,
            default_chunk_size: u64::MAX,
            max_parts: 1,
            max_chunk_size: u64::MAX,
        }
    }

    /// Azure block blobs: 2MB blocks, block ids padded to 6 digits
    pub fn azure_blob() -> Self {
        Self {
            direct_limit: 2 * MIB,
            default_chunk_size: 2 * MIB,
            max_parts: 50_000,
            max_chunk_size: 100 * MIB,
        }
    }

    /// OpenStack Swift / Rackspace Cloud Files: 2MB segments
    pub fn openstack_swift() -> Self {
        Self {
            direct_limit: 2 * MIB,
            default_chunk_size: 2 * MIB,
            max_parts: 1_000,
            max_chunk_size: 5 * 1024 * MIB,
        }
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Pick a chunk size keeping `ceil(file_size / chunk_size) <= max_parts`.
///
/// The default is only ever enlarged, never shrunk, and the result is
/// immutable for the life of a session.
pub fn plan_chunk_size(file_size: u64, limits: &ProviderLimits) -> Result<u64, PlanError> {
    if file_size == 0 {
        return Err(PlanError::EmptyFile);
    }

    let mut chunk_size = limits.default_chunk_size;
    if div_ceil(file_size, chunk_size) > limits.max_parts {
        chunk_size = div_ceil(file_size, limits.max_parts);
    }

    if chunk_size > limits.max_chunk_size {
        return Err(PlanError::FileTooLarge {
            file_size,
            max_parts: limits.max_parts,
            max_chunk_size: limits.max_chunk_size,
        });
    }

    Ok(chunk_size)
}

/// Number of parts for a file at the given chunk size
pub fn part_count(file_size: u64, chunk_size: u64) -> u64 {
    div_ceil(file_size, chunk_size)
}

/// Byte range of part `n`: `[(n-1) * chunk_size, min(n * chunk_size, file_size))`.
/// The last part keeps whatever remainder is left.
pub fn part_range(part_number: u32, chunk_size: u64, file_size: u64) -> Range<u64> {
    let start = (part_number as u64 - 1) * chunk_size;
    let end = (part_number as u64 * chunk_size).min(file_size);
    start..end
}

/// True if part `n` still falls inside the file
pub fn part_exists(part_number: u32, chunk_size: u64, file_size: u64) -> bool {
    (part_number as u64 - 1) * chunk_size < file_size
}
