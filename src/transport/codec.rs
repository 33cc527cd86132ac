//! NDJSON codec for the agent CLI's stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum line length
//! so an unterminated or runaway line from a misbehaving child cannot
//! exhaust memory. Used through [`tokio_util::codec::FramedRead`] on the
//! inbound side; outbound lines are written directly by the writer task.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AgentError, Result};

/// Maximum accepted inbound line length: 1 MiB. Longer lines decode to
/// [`AgentError::Protocol`] instead of allocating.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Length-bounded NDJSON line codec.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Codec bounded by [`MAX_LINE_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for LineCodec {
    type Error = AgentError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AgentError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AgentError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AgentError::Io(io_err.to_string()),
    }
}
