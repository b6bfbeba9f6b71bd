//! Sequence-numbered events delivered over push streams.

use serde::Serialize;
use serde_json::Value;

use super::message::RequestId;

/// What an event carries; becomes the SSE `event:` field.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A server-initiated JSON-RPC message.
    Message,
    /// One slice of a chunked result.
    Chunk,
    /// Final response closing a chunked result.
    End,
    /// Terminal failure of a stream.
    Error,
}

impl EventKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Chunk => "chunk",
            Self::End => "end",
            Self::Error => "error",
        }
    }
}

/// Which delivery path produced the event.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Session-level notification for the standalone push stream.
    Push,
    /// Part of a streamed response to a specific request.
    Request,
}

/// One immutable entry of a session's event log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamEvent {
    /// Strictly increasing per session, starting at 1.
    pub seq: u64,
    /// Event type.
    pub kind: EventKind,
    /// Producing path.
    pub origin: EventOrigin,
    /// Request answered by a [`EventOrigin::Request`] event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestId>,
    /// Exactly one JSON-RPC message.
    pub payload: Value,
}

impl StreamEvent {
    /// Whether this event closes the streamed reply to `id`.
    #[must_use]
    pub fn ends_reply_to(&self, id: &RequestId) -> bool {
        matches!(self.kind, EventKind::End | EventKind::Error) && self.request.as_ref() == Some(id)
    }
}
