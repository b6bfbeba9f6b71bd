//! `read_range` — positional byte read through a shared lazy handle.

use serde::Deserialize;
use serde_json::json;

use super::util::{self, MAX_READ_BYTES};
use super::ToolDescriptor;
use crate::engine::emitter::ToolOutput;
use crate::mcp::context::ToolContext;
use crate::{AppError, Result};

/// Arguments for `read_range`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadRangeInput {
    /// File path relative to the data root.
    pub path: String,
    /// First byte to read.
    pub offset: u64,
    /// Number of bytes to read.
    pub length: u64,
}

/// Tool descriptor.
#[must_use]
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "read_range",
        "Read a byte range of a file as UTF-8 text.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "offset": { "type": "integer", "minimum": 0 },
                "length": { "type": "integer", "minimum": 1, "maximum": MAX_READ_BYTES }
            },
            "required": ["path", "offset", "length"],
            "additionalProperties": false
        }),
    )
}

/// Handle a `read_range` call.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` for an empty or oversized range, plus
/// path and I/O failures.
pub async fn handle(ctx: ToolContext, input: ReadRangeInput) -> Result<ToolOutput> {
    if input.length == 0 || input.length > MAX_READ_BYTES {
        return Err(AppError::InvalidParams(format!(
            "length must be between 1 and {MAX_READ_BYTES}"
        )));
    }
    let path = ctx.engine.resolve(&input.path)?;
    let display = ctx.engine.relative(&path);
    let size = util::file_metadata(&path, &display).await?.len();

    let handle = ctx.engine.handles.acquire(&path);
    let bytes = handle
        .read_at(input.offset, util::to_usize(input.length))
        .await?;
    ctx.ensure_active()?;

    let read = bytes.len() as u64;
    let text = String::from_utf8_lossy(&bytes);
    let lossy = std::str::from_utf8(&bytes).is_err();
    Ok(ToolOutput::Value(json!({
        "path": display,
        "offset": input.offset,
        "length": read,
        "eof": input.offset + read >= size,
        "lossy": lossy,
        "text": text,
    })))
}
