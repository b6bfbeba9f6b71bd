//! `search` — regular-expression scan of a file on the worker pool.
//!
//! The file is split into byte ranges whose edges are moved forward to the
//! next line start, so every line belongs to exactly one range. Each range
//! reports its matches with range-local line indexes plus its newline
//! count; global line numbers are recovered by a prefix sum.

use std::fs::File;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::util::{self, RANGE_BYTES};
use super::ToolDescriptor;
use crate::engine::emitter::ToolOutput;
use crate::engine::lazy::read_exact_at;
use crate::mcp::context::ToolContext;
use crate::{AppError, Result};

const DEFAULT_MAX_MATCHES: usize = 1000;
const MAX_MATCH_CHARS: usize = 512;
const SCAN_WINDOW_BYTES: usize = 64 * 1024;

/// Arguments for `search`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchInput {
    /// File path relative to the data root.
    pub path: String,
    /// Regular expression matched against each line.
    pub pattern: String,
    /// Stop after this many matches.
    #[serde(default)]
    pub max_matches: Option<usize>,
}

/// Tool descriptor.
#[must_use]
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "search",
        "Find lines matching a regular expression. Matches are streamed in line order.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "pattern": { "type": "string", "description": "Regular expression" },
                "max_matches": { "type": "integer", "minimum": 1, "default": DEFAULT_MAX_MATCHES }
            },
            "required": ["path", "pattern"],
            "additionalProperties": false
        }),
    )
}

#[derive(Debug, Default)]
struct RangeScan {
    newlines: u64,
    matches: Vec<(u64, String)>,
}

/// Handle a `search` call.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` for a bad pattern, plus path, I/O,
/// capacity and cancellation failures.
pub async fn handle(ctx: ToolContext, input: SearchInput) -> Result<ToolOutput> {
    let regex = Regex::new(&input.pattern)
        .map_err(|err| AppError::InvalidParams(format!("invalid pattern: {err}")))?;
    let max_matches = input.max_matches.unwrap_or(DEFAULT_MAX_MATCHES).max(1);
    let path = ctx.engine.resolve(&input.path)?;
    let display = ctx.engine.relative(&path);
    let size = util::file_metadata(&path, &display).await?.len();

    let handle = ctx.engine.handles.acquire(&path);
    let file = handle.file().await?;
    let ranges = util::split_ranges(size, RANGE_BYTES);
    let scanned = ranges.len();
    let jobs: Vec<(u64, _)> = ranges
        .into_iter()
        .map(|(offset, length)| {
            let file = Arc::clone(&file);
            let regex = regex.clone();
            let job = move |cancel: &CancellationToken| {
                scan_range(&file, offset, offset + length, size, &regex, max_matches, cancel)
            };
            (offset, job)
        })
        .collect();

    let mut lines_before = 0;
    let mut found: Vec<Value> = Vec::new();
    for (_, outcome) in ctx.engine.pool.run_keyed(jobs, &ctx.cancel).await {
        let scan = outcome?;
        for (local, text) in scan.matches {
            found.push(json!({ "line": lines_before + local + 1, "text": text }));
        }
        lines_before += scan.newlines;
    }
    drop(handle);

    let truncated = found.len() > max_matches;
    found.truncate(max_matches);

    let mut trailer = Map::new();
    trailer.insert("path".into(), json!(display));
    trailer.insert("pattern".into(), json!(input.pattern));
    trailer.insert("truncated".into(), json!(truncated));
    trailer.insert("scannedRanges".into(), json!(scanned));
    Ok(ToolOutput::Items {
        items: stream::iter(found.into_iter().map(Ok)).boxed(),
        trailer,
    })
}

/// First line start at or after `pos`.
fn line_start_at_or_after(file: &File, pos: u64, size: u64) -> Result<u64> {
    if pos == 0 || pos >= size {
        return Ok(pos.min(size));
    }
    let previous = read_exact_at(file, pos - 1, 1)?;
    if previous.first() == Some(&b'\n') {
        return Ok(pos);
    }
    let mut cursor = pos;
    while cursor < size {
        let window = read_exact_at(file, cursor, SCAN_WINDOW_BYTES)?;
        if window.is_empty() {
            break;
        }
        if let Some(i) = window.iter().position(|b| *b == b'\n') {
            return Ok(cursor + i as u64 + 1);
        }
        cursor += window.len() as u64;
    }
    Ok(size)
}

fn scan_range(
    file: &File,
    offset: u64,
    end: u64,
    size: u64,
    regex: &Regex,
    max_matches: usize,
    cancel: &CancellationToken,
) -> Result<RangeScan> {
    let start = line_start_at_or_after(file, offset, size)?;
    let stop = line_start_at_or_after(file, end, size)?;
    if start >= stop {
        return Ok(RangeScan::default());
    }
    let region = read_exact_at(file, start, util::to_usize(stop - start))?;

    let mut scan = RangeScan::default();
    let mut pieces = region.split(|b| *b == b'\n').peekable();
    let mut index = 0_u64;
    while let Some(piece) = pieces.next() {
        if pieces.peek().is_none() && piece.is_empty() {
            break;
        }
        if index % 4096 == 0 && cancel.is_cancelled() {
            return Err(AppError::Cancelled("search cancelled".into()));
        }
        if scan.matches.len() < max_matches + 1 {
            let line = String::from_utf8_lossy(piece.strip_suffix(b"\r").unwrap_or(piece));
            if regex.is_match(&line) {
                scan.matches.push((index, clip(&line, MAX_MATCH_CHARS)));
            }
        }
        index += 1;
    }
    scan.newlines = region.iter().filter(|b| **b == b'\n').count() as u64;
    Ok(scan)
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}
