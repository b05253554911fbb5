//! Lifecycle errors
//!
//! Every failure carries one `ErrorKind`, which is what the command line
//! maps to an exit status. Variants keep their source error so the full
//! chain can still be logged.

use std::io;
use std::path::PathBuf;

use kickpass_agent::{AgentError, PathError};
use kickpass_crypto::CipherError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    AlreadyExists,
    NotFound,
    AuthenticationFailed,
    ResourceExhausted,
    IoFailure,
    ProtocolViolation,
}

impl ErrorKind {
    /// Process exit status for this kind; 0 is reserved for success
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::InvalidInput => 2,
            ErrorKind::AlreadyExists => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::AuthenticationFailed => 5,
            ErrorKind::ResourceExhausted => 6,
            ErrorKind::IoFailure => 7,
            ErrorKind::ProtocolViolation => 8,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad passphrase or corrupted safe")]
    AuthenticationFailed(#[source] CipherError),

    #[error(transparent)]
    Crypto(CipherError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("editor {program} failed: {status}")]
    Editor { program: String, status: String },

    #[error("invalid configuration {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot erase plaintext {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::Config { .. } => ErrorKind::InvalidInput,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Error::Crypto(CipherError::TooLarge { .. }) => ErrorKind::InvalidInput,
            Error::Crypto(_) => ErrorKind::IoFailure,
            Error::Io { .. } | Error::Editor { .. } | Error::Cleanup { .. } => ErrorKind::IoFailure,
            Error::Agent(e) => match e {
                AgentError::Protocol(_) => ErrorKind::ProtocolViolation,
                AgentError::Exhausted(_) => ErrorKind::ResourceExhausted,
                AgentError::InvalidSafe(_) | AgentError::PathTooLong(_) => ErrorKind::InvalidInput,
                AgentError::AlreadyRunning(_) => ErrorKind::AlreadyExists,
                AgentError::Connect { .. }
                | AgentError::Listen { .. }
                | AgentError::NotConnected
                | AgentError::Io(_) => ErrorKind::IoFailure,
            },
        }
    }
}

impl From<CipherError> for Error {
    fn from(err: CipherError) -> Self {
        if err.is_integrity_failure() {
            Error::AuthenticationFailed(err)
        } else {
            Error::Crypto(err)
        }
    }
}

impl From<PathError> for Error {
    fn from(err: PathError) -> Self {
        Error::InvalidInput(format!("invalid safe path: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failures_are_authentication() {
        for err in [
            CipherError::AuthenticationFailed,
            CipherError::Malformed("bad magic"),
            CipherError::UnsupportedVersion(9),
            CipherError::UnsupportedAlgorithm(7),
        ] {
            assert_eq!(Error::from(err).kind(), ErrorKind::AuthenticationFailed);
        }
        assert_eq!(Error::from(CipherError::Rng).kind(), ErrorKind::IoFailure);
        assert_eq!(
            Error::from(CipherError::TooLarge { len: 2, max: 1 }).kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidInput,
            ErrorKind::AlreadyExists,
            ErrorKind::NotFound,
            ErrorKind::AuthenticationFailed,
            ErrorKind::ResourceExhausted,
            ErrorKind::IoFailure,
            ErrorKind::ProtocolViolation,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_agent_errors_keep_their_kind() {
        let err = Error::from(AgentError::Protocol(
            kickpass_agent::ProtocolError::Truncated,
        ));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        let err = Error::from(AgentError::NotConnected);
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }
}
