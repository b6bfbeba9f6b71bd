//! Shared utilities for tool handlers.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::{AppError, Result};

/// Bytes scanned per pool task when a file is split into ranges.
pub const RANGE_BYTES: u64 = 1024 * 1024;

/// Largest slice `read_range` returns in one call.
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Split `[0, len)` into consecutive `(offset, length)` ranges.
#[must_use]
pub fn split_ranges(len: u64, range_bytes: u64) -> Vec<(u64, u64)> {
    let step = range_bytes.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < len {
        let length = step.min(len - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// Modification time as nanoseconds since the epoch, for cache keys.
#[must_use]
pub fn mtime_nanos(modified: Option<SystemTime>) -> u128 {
    modified
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos())
}

/// Modification time rendered as RFC 3339, or `null` when unavailable.
#[must_use]
pub fn mtime_rfc3339(modified: Option<SystemTime>) -> Value {
    modified.map_or(Value::Null, |t| json!(DateTime::<Utc>::from(t).to_rfc3339()))
}

/// Metadata of a regular file inside the data root.
///
/// # Errors
///
/// - `AppError::InvalidParams` when `path` is a directory.
/// - `AppError::Io` when metadata cannot be read.
pub async fn file_metadata(path: &Path, display: &str) -> Result<std::fs::Metadata> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        return Err(AppError::InvalidParams(format!("{display} is a directory")));
    }
    Ok(meta)
}

/// Convert a byte count to `usize`, saturating on narrow targets.
#[must_use]
pub fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}
