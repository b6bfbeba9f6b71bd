//! `file_info` — size, modification time and line count of a data file.
//!
//! The line count is computed by scanning byte ranges in parallel on the
//! worker pool through one shared lazy handle. Results are cached by path,
//! length and modification time, so a changed file is recounted.

use std::fs::File;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::util::{self, RANGE_BYTES};
use super::ToolDescriptor;
use crate::engine::cache::CacheKey;
use crate::engine::emitter::ToolOutput;
use crate::engine::lazy::read_exact_at;
use crate::mcp::context::ToolContext;
use crate::{AppError, Result};

/// Arguments for `file_info`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileInfoInput {
    /// File path relative to the data root.
    pub path: String,
}

/// Tool descriptor.
#[must_use]
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "file_info",
        "Report size, modification time and line count of a file.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the data root" }
            },
            "required": ["path"],
            "additionalProperties": false
        }),
    )
}

/// Handle a `file_info` call.
///
/// # Errors
///
/// Returns path, I/O, capacity or cancellation failures.
pub async fn handle(ctx: ToolContext, input: FileInfoInput) -> Result<ToolOutput> {
    let path = ctx.engine.resolve(&input.path)?;
    let shown = ctx.engine.relative(&path);
    let meta = util::file_metadata(&path, &shown).await?;
    let size = meta.len();
    let modified = meta.modified().ok();

    let key = CacheKey::new(
        "file_info",
        &json!({
            "path": shown,
            "len": size,
            "mtime": util::mtime_nanos(modified).to_string(),
        }),
    );

    let span = info_span!("file_info", path = %shown, size);
    let leader = ctx.clone();
    let value = ctx
        .engine
        .cache
        .get_or_compute(&key, &ctx.cancel, move |cancel| {
            async move {
                let handle = leader.engine.handles.acquire(&path);
                let file = handle.file().await?;
                let lines = count_lines(&leader, &file, size, &cancel).await?;
                debug!(lines, "line count computed");
                Ok(json!({
                    "path": shown,
                    "size": size,
                    "modified": util::mtime_rfc3339(modified),
                    "lines": lines,
                }))
            }
            .instrument(span)
        })
        .await?;
    Ok(ToolOutput::Value(Value::clone(&value)))
}

/// Progress goes to the session that started the count; `cancel` belongs
/// to the cached computation.
async fn count_lines(
    ctx: &ToolContext,
    file: &Arc<File>,
    size: u64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let ranges = util::split_ranges(size, RANGE_BYTES);
    let total = ranges.len() as u64;
    let jobs: Vec<(usize, _)> = ranges
        .into_iter()
        .enumerate()
        .map(|(index, (offset, length))| {
            let file = Arc::clone(file);
            let job = move |cancel: &CancellationToken| -> Result<(u64, Option<u8>)> {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled("line count cancelled".into()));
                }
                let bytes = read_exact_at(&file, offset, util::to_usize(length))?;
                let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
                Ok((newlines, bytes.last().copied()))
            };
            (index, job)
        })
        .collect();

    let mut newlines = 0;
    let mut last_byte = None;
    let mut done = 0;
    for (_, outcome) in ctx.engine.pool.run_keyed(jobs, cancel).await {
        let (count, last) = outcome?;
        newlines += count;
        last_byte = last.or(last_byte);
        done += 1;
        ctx.report_progress(done, Some(total));
    }
    let unterminated = u64::from(last_byte.is_some_and(|b| b != b'\n'));
    Ok(newlines + unterminated)
}
