//! `read_lines` — stream a window of lines through the emitter.

use futures_util::stream::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::util;
use super::ToolDescriptor;
use crate::engine::emitter::ToolOutput;
use crate::mcp::codec::MAX_LINE_BYTES;
use crate::mcp::context::ToolContext;
use crate::{AppError, Result};

/// Arguments for `read_lines`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadLinesInput {
    /// File path relative to the data root.
    pub path: String,
    /// First line to return, 1-based.
    #[serde(default = "default_start")]
    pub start: u64,
    /// Maximum number of lines; unlimited when absent.
    #[serde(default)]
    pub limit: Option<u64>,
}

fn default_start() -> u64 {
    1
}

/// Tool descriptor.
#[must_use]
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "read_lines",
        "Read lines of a text file. Large results are delivered in chunks.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "start": { "type": "integer", "minimum": 1, "default": 1 },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"],
            "additionalProperties": false
        }),
    )
}

/// Handle a `read_lines` call.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` when `start` is zero, plus path and
/// I/O failures. Errors while streaming surface as a terminal frame.
pub async fn handle(ctx: ToolContext, input: ReadLinesInput) -> Result<ToolOutput> {
    if input.start == 0 {
        return Err(AppError::InvalidParams("start is 1-based".into()));
    }
    let path = ctx.engine.resolve(&input.path)?;
    let display = ctx.engine.relative(&path);
    util::file_metadata(&path, &display).await?;

    let file = tokio::fs::File::open(&path).await?;
    let skip = util::to_usize(input.start - 1);
    let take = input.limit.map_or(usize::MAX, util::to_usize);
    let cancel = ctx.cancel.clone();

    let items = FramedRead::new(file, LinesCodec::new_with_max_length(MAX_LINE_BYTES))
        .enumerate()
        .skip(skip)
        .take(take)
        .map(move |(index, line)| {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("read_lines cancelled".into()));
            }
            let text = line.map_err(|err| match err {
                LinesCodecError::MaxLineLengthExceeded => AppError::Upstream(format!(
                    "line {} exceeds {MAX_LINE_BYTES} bytes",
                    index + 1
                )),
                LinesCodecError::Io(io) => AppError::Io(io.to_string()),
            })?;
            Ok(json!({ "line": index + 1, "text": text }))
        })
        .boxed();

    let mut trailer = Map::new();
    trailer.insert("path".into(), json!(display));
    trailer.insert("start".into(), json!(input.start));
    Ok(ToolOutput::Items { items, trailer })
}
