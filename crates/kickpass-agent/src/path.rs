//! Logical safe paths
//!
//! A safe path names a safe relative to the storage root ("email/gmail").
//! It is the key of the agent cache and of the on-disk layout, so it is
//! validated once here and carried around as a `SafePath` afterwards.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Longest accepted safe path, in bytes
pub const PATH_MAX_LEN: usize = 4096;
/// Longest accepted password, in bytes
pub const PASSWORD_MAX_LEN: usize = 4096;
/// Longest accepted metadata, in bytes
pub const METADATA_MAX_LEN: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("safe path is empty")]
    Empty,
    #[error("safe path is {0} bytes long, at most {max} allowed", max = PATH_MAX_LEN)]
    TooLong(usize),
    #[error("safe path must be relative")]
    Absolute,
    #[error("safe path contains an invalid component: {0:?}")]
    InvalidComponent(String),
    #[error("safe path contains a NUL byte")]
    Nul,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SafePath(String);

impl SafePath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();

        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if path.len() > PATH_MAX_LEN {
            return Err(PathError::TooLong(path.len()));
        }
        if path.contains('\0') {
            return Err(PathError::Nul);
        }
        if path.starts_with('/') {
            return Err(PathError::Absolute);
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(PathError::InvalidComponent(component.to_string()));
            }
        }

        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components, root first
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

/// Byte-wise comparison never looking past `PATH_MAX_LEN`
fn bounded_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let a = &a[..a.len().min(PATH_MAX_LEN)];
    let b = &b[..b.len().min(PATH_MAX_LEN)];
    a.cmp(b)
}

impl Ord for SafePath {
    fn cmp(&self, other: &Self) -> Ordering {
        bounded_cmp(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl PartialOrd for SafePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Borrow<str> for SafePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SafePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SafePath {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafePath({:?})", self.0)
    }
}
