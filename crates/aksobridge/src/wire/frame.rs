//! Frame codec for client connections.
//!
//! Decoding runs a small state machine over whatever bytes the transport
//! delivers: preamble once, then alternating length and body. Frame
//! boundaries depend only on the length field, never on read sizes.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, Outbound};
use super::{MAGIC, MAX_MESSAGE_LEN, codes};

/// Fatal framing failure. The connection reports it and closes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,

    #[error("message has negative length")]
    NegativeLength(i32),

    #[error("message is too long")]
    TooLong(usize),

    #[error("failed to decode input: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Transport error code sent to the client, if the error is reportable.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::BadMagic => Some(codes::BAD_MAGIC),
            Self::NegativeLength(_) | Self::TooLong(_) => Some(codes::BAD_LENGTH),
            Self::Decode(_) => Some(codes::DECODE),
            Self::Io(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingMagic,
    AwaitingLength,
    AwaitingBody(usize),
}

/// Decodes inbound [`Message`]s and encodes [`Outbound`] frames.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec for a fresh connection; expects the preamble first.
    pub fn new() -> Self {
        Self {
            state: ReadState::AwaitingMagic,
        }
    }

    /// Codec that skips the preamble check.
    pub fn without_magic() -> Self {
        Self {
            state: ReadState::AwaitingLength,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReadState::AwaitingMagic => {
                    if src.len() < MAGIC.len() {
                        return Ok(None);
                    }
                    if &src[..MAGIC.len()] != MAGIC {
                        return Err(FrameError::BadMagic);
                    }
                    src.advance(MAGIC.len());
                    self.state = ReadState::AwaitingLength;
                }
                ReadState::AwaitingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let len = src.get_i32_le();
                    if len < 0 {
                        return Err(FrameError::NegativeLength(len));
                    }
                    let len = len as usize;
                    if len > MAX_MESSAGE_LEN {
                        return Err(FrameError::TooLong(len));
                    }
                    src.reserve(len.saturating_sub(src.len()));
                    self.state = ReadState::AwaitingBody(len);
                }
                ReadState::AwaitingBody(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = ReadState::AwaitingLength;
                    return decode_body(&body).map(Some);
                }
            }
        }
    }
}

fn decode_body(body: &[u8]) -> Result<Message, FrameError> {
    let mut rd = body;
    let value =
        rmpv::decode::read_value(&mut rd).map_err(|e| FrameError::Decode(e.to_string()))?;
    if !rd.is_empty() {
        return Err(FrameError::Decode(format!(
            "{} trailing bytes after message",
            rd.len()
        )));
    }
    Message::from_value(value).map_err(FrameError::Decode)
}

impl Encoder<Outbound> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = Vec::new();
        item.write_to(&mut body)?;
        let len = i32::try_from(body.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "outbound frame exceeds i32 length")
        })?;

        dst.reserve(4 + body.len());
        dst.put_i32_le(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
