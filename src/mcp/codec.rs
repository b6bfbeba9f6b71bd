//! Newline-delimited JSON framing for the local channel.
//!
//! Wraps [`LinesCodec`] with a maximum line length. Over-long or non-UTF-8
//! inbound lines decode to [`Inbound::Rejected`] rather than an error, and
//! the codec resynchronizes at the next newline, so one bad message never
//! tears down the channel.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::AppError;

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete line without its terminator.
    Line(String),
    /// A line that cannot be a message; its bytes were discarded.
    Rejected(AppError),
}

/// NDJSON codec: one JSON message per `\n`-terminated UTF-8 line.
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec with a custom limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max),
            max_length: max,
        }
    }

    /// Longest accepted line, in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Inbound;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, std::io::Error> {
        classify(self.inner.decode(src), self.max_length)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, std::io::Error> {
        classify(self.inner.decode_eof(src), self.max_length)
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    /// Frames containing a raw newline would split into two messages on
    /// the wire and are refused.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        if item.contains('\n') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "outbound frame contains a newline",
            ));
        }
        self.inner.encode(item, dst).map_err(|err| match err {
            LinesCodecError::Io(io) => io,
            LinesCodecError::MaxLineLengthExceeded => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "line too long")
            }
        })
    }
}

fn classify(
    decoded: Result<Option<String>, LinesCodecError>,
    max_length: usize,
) -> Result<Option<Inbound>, std::io::Error> {
    match decoded {
        Ok(line) => Ok(line.map(Inbound::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::Rejected(
            AppError::Parse(format!("message exceeds {max_length} bytes")),
        ))),
        Err(LinesCodecError::Io(io)) if io.kind() == std::io::ErrorKind::InvalidData => Ok(Some(
            Inbound::Rejected(AppError::Parse("message is not valid UTF-8".into())),
        )),
        Err(LinesCodecError::Io(io)) => Err(io),
    }
}
