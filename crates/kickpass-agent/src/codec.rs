//! Agent wire framing
//!
//! Every frame is length-prefixed and self-delimiting:
//!
//! ```text
//! len (u32 BE, whole frame) | type (u32 BE) | id (u32 BE) | pid (u32 BE) | payload
//! ```
//!
//! `decode_frame` and `encode_frame` are pure functions over byte buffers;
//! `FrameCodec` plugs them into tokio-util so partial reads and writes on a
//! socket are buffered until a whole frame is available.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{AgentError, ProtocolError};

pub const HEADER_LEN: usize = 16;
pub const MAX_FRAME_LEN: usize = 16 * 1024;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Remember a decrypted safe (fire and forget)
    Store = 1,
    /// Ask for a cached safe
    Fetch = 2,
    /// Reply to Fetch carrying the safe
    Found = 3,
    /// Reply to Fetch when nothing is cached
    Missing = 4,
    /// Forget a cached safe (fire and forget)
    Discard = 5,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Store => "store",
            MessageType::Fetch => "fetch",
            MessageType::Found => "found",
            MessageType::Missing => "missing",
            MessageType::Discard => "discard",
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Store),
            2 => Ok(MessageType::Fetch),
            3 => Ok(MessageType::Found),
            4 => Ok(MessageType::Missing),
            5 => Ok(MessageType::Discard),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// One decoded frame; the payload may hold secrets and is zeroed on drop
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub id: u32,
    pub pid: u32,
    pub payload: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Append one encoded frame to `dst`
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = HEADER_LEN + frame.payload.len();
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    dst.reserve(len);
    dst.put_u32(len as u32);
    dst.put_u32(frame.kind as u32);
    dst.put_u32(frame.id);
    dst.put_u32(frame.pid);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Take one frame off the front of `src`, or `None` if more bytes are needed
///
/// The length prefix is validated before anything else is read, so a
/// hostile length can neither trigger a huge allocation nor an
/// out-of-bounds read.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if src.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len < HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(len));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if src.len() < len {
        src.reserve(len - src.len());
        return Ok(None);
    }

    let mut raw = src.split_to(len);
    raw.advance(4);
    let kind = MessageType::try_from(raw.get_u32());
    let id = raw.get_u32();
    let pid = raw.get_u32();
    let payload = Zeroizing::new(raw.to_vec());
    raw[..].zeroize();

    Ok(Some(Frame {
        kind: kind?,
        id,
        pid,
        payload,
    }))
}

/// Length-prefixed frame codec for `Framed` sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AgentError> {
        Ok(decode_frame(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AgentError> {
        match decode_frame(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                src[..].zeroize();
                src.clear();
                Err(ProtocolError::Incomplete.into())
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AgentError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), AgentError> {
        Ok(encode_frame(&frame, dst)?)
    }
}
