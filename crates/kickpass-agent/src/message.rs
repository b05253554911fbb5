//! Typed agent messages and their payload layout
//!
//! Payload fields are `u16` length-prefixed byte strings in a fixed order:
//! Store and Found carry path, password and metadata; Fetch, Missing and
//! Discard carry only the path. Each field is bounded by its maximum length.

use std::fmt;

use bytes::{Buf, BufMut};
use zeroize::Zeroizing;

use crate::codec::{Frame, MessageType};
use crate::error::ProtocolError;
use crate::path::{SafePath, METADATA_MAX_LEN, PASSWORD_MAX_LEN, PATH_MAX_LEN};

/// A safe as carried over the wire
#[derive(Clone, PartialEq, Eq)]
pub struct SafeRecord {
    pub path: SafePath,
    pub password: Zeroizing<Vec<u8>>,
    pub metadata: Zeroizing<Vec<u8>>,
}

impl SafeRecord {
    pub fn new(path: SafePath, password: &[u8], metadata: &[u8]) -> Self {
        Self {
            path,
            password: Zeroizing::new(password.to_vec()),
            metadata: Zeroizing::new(metadata.to_vec()),
        }
    }
}

impl fmt::Debug for SafeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeRecord")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Store(SafeRecord),
    Fetch(SafePath),
    Found(SafeRecord),
    Missing(SafePath),
    Discard(SafePath),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Store(_) => MessageType::Store,
            Message::Fetch(_) => MessageType::Fetch,
            Message::Found(_) => MessageType::Found,
            Message::Missing(_) => MessageType::Missing,
            Message::Discard(_) => MessageType::Discard,
        }
    }

    pub fn path(&self) -> &SafePath {
        match self {
            Message::Store(r) | Message::Found(r) => &r.path,
            Message::Fetch(p) | Message::Missing(p) | Message::Discard(p) => p,
        }
    }

    /// Serialize into a frame carrying `id` and `pid`
    pub fn to_frame(&self, id: u32, pid: u32) -> Result<Frame, ProtocolError> {
        let mut payload = Zeroizing::new(Vec::new());
        match self {
            Message::Store(record) | Message::Found(record) => {
                put_field(&mut payload, "path", record.path.as_str().as_bytes(), PATH_MAX_LEN)?;
                put_field(&mut payload, "password", &record.password, PASSWORD_MAX_LEN)?;
                put_field(&mut payload, "metadata", &record.metadata, METADATA_MAX_LEN)?;
            }
            Message::Fetch(path) | Message::Missing(path) | Message::Discard(path) => {
                put_field(&mut payload, "path", path.as_str().as_bytes(), PATH_MAX_LEN)?;
            }
        }

        Ok(Frame {
            kind: self.kind(),
            id,
            pid,
            payload,
        })
    }

    /// Parse a frame's payload according to its type
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut buf: &[u8] = &frame.payload;

        let path = get_path(&mut buf)?;
        let message = match frame.kind {
            MessageType::Store | MessageType::Found => {
                let password = get_field(&mut buf, "password", PASSWORD_MAX_LEN)?;
                let metadata = get_field(&mut buf, "metadata", METADATA_MAX_LEN)?;
                let record = SafeRecord {
                    path,
                    password,
                    metadata,
                };
                if frame.kind == MessageType::Store {
                    Message::Store(record)
                } else {
                    Message::Found(record)
                }
            }
            MessageType::Fetch => Message::Fetch(path),
            MessageType::Missing => Message::Missing(path),
            MessageType::Discard => Message::Discard(path),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes);
        }
        Ok(message)
    }
}

fn put_field(
    out: &mut Vec<u8>,
    field: &'static str,
    value: &[u8],
    max: usize,
) -> Result<(), ProtocolError> {
    if value.len() > max {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    out.put_u16(value.len() as u16);
    out.put_slice(value);
    Ok(())
}

fn get_field(
    buf: &mut &[u8],
    field: &'static str,
    max: usize,
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let value = Zeroizing::new(buf[..len].to_vec());
    buf.advance(len);
    Ok(value)
}

fn get_path(buf: &mut &[u8]) -> Result<SafePath, ProtocolError> {
    let raw = get_field(buf, "path", PATH_MAX_LEN)?;
    let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(SafePath::new(text)?)
}
