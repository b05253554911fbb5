//! Agent errors
//!
//! Transport failures (connect, listen) are kept apart from protocol
//! failures so callers can tell "no agent running" from "agent sent garbage".

use std::io;
use std::path::PathBuf;

use kickpass_crypto::GuardedError;
use thiserror::Error;

use crate::path::PathError;

/// A received frame or payload that does not follow the protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame length {0} is shorter than the frame header")]
    FrameTooShort(usize),

    #[error("frame length {len} exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("truncated payload")]
    Truncated,

    #[error("trailing bytes after payload")]
    TrailingBytes,

    #[error("{field} is {len} bytes long, at most {max} allowed")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("safe path in payload is not UTF-8")]
    InvalidUtf8,

    #[error("invalid safe path in payload: {0}")]
    InvalidPath(#[from] PathError),

    #[error("unexpected {0} message")]
    Unexpected(&'static str),

    #[error("reply id {got} does not match request id {expected}")]
    Uncorrelated { expected: u32, got: u32 },

    #[error("connection closed mid-frame")]
    Incomplete,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("cannot connect to agent at {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error("cannot listen on {}: {source}", path.display())]
    Listen { path: PathBuf, source: io::Error },

    #[error("an agent is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("socket path too long: {}", .0.display())]
    PathTooLong(PathBuf),

    #[error("not connected to agent")]
    NotConnected,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("guarded memory exhausted: {0}")]
    Exhausted(GuardedError),

    #[error("invalid safe: {0}")]
    InvalidSafe(String),

    #[error("agent I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<GuardedError> for AgentError {
    fn from(err: GuardedError) -> Self {
        match err {
            GuardedError::TooLarge { .. } => AgentError::InvalidSafe(err.to_string()),
            GuardedError::AllocationFailed(_) => AgentError::Exhausted(err),
        }
    }
}

impl From<PathError> for AgentError {
    fn from(err: PathError) -> Self {
        AgentError::InvalidSafe(err.to_string())
    }
}
