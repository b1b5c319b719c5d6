//! Length-delimited framing for the control socket.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. Decoding yields the raw frame so the router can read the routing
//! header before committing to a full decode.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::message::ControlMessage;
use crate::errors::ProtocolError;
use crate::{AppError, Result};

/// Largest accepted frame: 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec for control-socket frames.
#[derive(Debug)]
pub struct ControlCodec(LengthDelimitedCodec);

impl ControlCodec {
    /// Codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }

    /// Codec with a custom frame limit.
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self(
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame)
                .new_codec(),
        )
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = BytesMut;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_frame_error)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = AppError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<()> {
        let body = item.encode()?;
        self.0.encode(Bytes::from(body), dst).map_err(map_frame_error)
    }
}

fn map_frame_error(err: std::io::Error) -> AppError {
    // LengthDelimitedCodec reports oversized frames as InvalidData.
    if err.kind() == std::io::ErrorKind::InvalidData {
        ProtocolError::MalformedMessage(format!("frame rejected: {err}")).into()
    } else {
        AppError::Io(err.to_string())
    }
}
