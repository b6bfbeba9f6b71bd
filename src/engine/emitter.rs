//! Chunked delivery of large tool results.
//!
//! Tools that produce many items return them as a stream. Small results are
//! collapsed into a single inline value; once the buffered size passes the
//! inline threshold the remainder is delivered as ordered chunk frames
//! closed by an end frame, or by a failure frame if the stream errors.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Map, Value};

use super::cache::estimate_json_size;
use crate::config::StreamingConfig;
use crate::{AppError, Result};

/// Stream of result items produced by a tool.
pub type ItemStream = BoxStream<'static, Result<Value>>;

/// What a tool hands back to the router.
pub enum ToolOutput {
    /// A complete result value.
    Value(Value),
    /// Items to be delivered inline or in chunks; `trailer` members are
    /// merged into the final result.
    Items {
        /// Item producer.
        items: ItemStream,
        /// Summary fields attached to the final result.
        trailer: Map<String, Value>,
    },
}

impl ToolOutput {
    /// Items with an empty trailer.
    #[must_use]
    pub fn items(items: ItemStream) -> Self {
        Self::Items {
            items,
            trailer: Map::new(),
        }
    }
}

/// One unit of chunked delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A slice of items; `index` starts at 0.
    Chunk {
        /// Position of this chunk.
        index: usize,
        /// Items in this chunk.
        items: Vec<Value>,
    },
    /// Successful end of the stream.
    End {
        /// Items delivered across all chunks.
        total_items: usize,
        /// Number of chunk frames.
        chunks: usize,
        /// Summary fields from the tool.
        trailer: Map<String, Value>,
    },
    /// Terminal failure; no further frames follow.
    Failed(AppError),
}

impl Frame {
    /// Final result value carried by an [`Frame::End`].
    #[must_use]
    pub fn end_result(total_items: usize, chunks: usize, trailer: &Map<String, Value>) -> Value {
        let mut result = trailer.clone();
        result.insert("totalItems".into(), json!(total_items));
        result.insert("chunks".into(), json!(chunks));
        Value::Object(result)
    }
}

/// How a result reaches the peer.
pub enum Emission {
    /// A single response.
    Inline(Value),
    /// Chunk frames followed by exactly one terminal frame.
    Chunked(BoxStream<'static, Frame>),
}

impl Emission {
    /// Collapse into one value for peers that cannot receive a stream.
    ///
    /// # Errors
    ///
    /// Returns the failure carried by a terminal [`Frame::Failed`].
    pub async fn into_value(self) -> Result<Value> {
        match self {
            Self::Inline(value) => Ok(value),
            Self::Chunked(mut frames) => {
                let mut items = Vec::new();
                while let Some(frame) = frames.next().await {
                    match frame {
                        Frame::Chunk { items: chunk, .. } => items.extend(chunk),
                        Frame::End {
                            total_items,
                            trailer,
                            ..
                        } => return Ok(inline_result(items, total_items, trailer)),
                        Frame::Failed(err) => return Err(err),
                    }
                }
                Err(AppError::Internal("chunk stream ended without a terminal frame".into()))
            }
        }
    }
}

fn inline_result(items: Vec<Value>, total: usize, trailer: Map<String, Value>) -> Value {
    let mut result = trailer;
    result.insert("items".into(), Value::Array(items));
    result.insert("totalItems".into(), json!(total));
    Value::Object(result)
}

/// Decides between inline and chunked delivery.
#[derive(Debug, Clone, Copy)]
pub struct Emitter {
    inline_threshold: usize,
    chunk_items: usize,
}

impl Emitter {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            inline_threshold: config.inline_threshold_bytes,
            chunk_items: config.chunk_items.max(1),
        }
    }

    /// Buffer the head of `output` and pick a delivery mode.
    ///
    /// # Errors
    ///
    /// Returns an item error raised before the threshold was reached; later
    /// errors surface as a [`Frame::Failed`].
    pub async fn plan(&self, output: ToolOutput) -> Result<Emission> {
        let (mut items, trailer) = match output {
            ToolOutput::Value(value) => return Ok(Emission::Inline(value)),
            ToolOutput::Items { items, trailer } => (items, trailer),
        };

        let mut buffered = VecDeque::new();
        let mut size = 0;
        while size <= self.inline_threshold {
            match items.next().await {
                Some(Ok(item)) => {
                    size += estimate_json_size(&item);
                    buffered.push_back(item);
                }
                Some(Err(err)) => return Err(err),
                None => {
                    let total = buffered.len();
                    return Ok(Emission::Inline(inline_result(
                        buffered.into(),
                        total,
                        trailer,
                    )));
                }
            }
        }

        let state = ChunkState {
            pending: buffered,
            rest: items,
            chunk_items: self.chunk_items,
            index: 0,
            total: 0,
            trailer,
            exhausted: false,
            failure: None,
            finished: false,
        };
        Ok(Emission::Chunked(stream::unfold(state, next_frame).boxed()))
    }
}

struct ChunkState {
    pending: VecDeque<Value>,
    rest: ItemStream,
    chunk_items: usize,
    index: usize,
    total: usize,
    trailer: Map<String, Value>,
    exhausted: bool,
    failure: Option<AppError>,
    finished: bool,
}

async fn next_frame(mut st: ChunkState) -> Option<(Frame, ChunkState)> {
    if st.finished {
        return None;
    }
    while !st.exhausted && st.failure.is_none() && st.pending.len() < st.chunk_items {
        match st.rest.next().await {
            Some(Ok(item)) => st.pending.push_back(item),
            Some(Err(err)) => st.failure = Some(err),
            None => st.exhausted = true,
        }
    }
    if !st.pending.is_empty() {
        let take = st.pending.len().min(st.chunk_items);
        let items: Vec<Value> = st.pending.drain(..take).collect();
        let frame = Frame::Chunk {
            index: st.index,
            items,
        };
        st.index += 1;
        st.total += take;
        return Some((frame, st));
    }
    st.finished = true;
    let frame = match st.failure.take() {
        Some(err) => Frame::Failed(err),
        None => Frame::End {
            total_items: st.total,
            chunks: st.index,
            trailer: std::mem::take(&mut st.trailer),
        },
    };
    Some((frame, st))
}
