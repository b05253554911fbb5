//! Password and metadata split of a safe's plaintext
//!
//! ```text
//! password: hunter2
//! url: https://example.com
//! login: me
//! ```
//!
//! The first line holds the password when it starts with `password:`;
//! everything after it is free-form metadata. A body without that line is
//! all metadata.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::Error;
use kickpass_agent::{METADATA_MAX_LEN, PASSWORD_MAX_LEN};

const PASSWORD_PREFIX: &[u8] = b"password:";

/// Bytes `render` adds around the fields: the prefix, a space and a newline
pub const RENDER_OVERHEAD: usize = PASSWORD_PREFIX.len() + 2;

/// Body of a freshly created safe
pub const TEMPLATE: &str = "password: \nurl: \n";

#[derive(Clone, PartialEq, Eq)]
pub struct SafeContents {
    password: Zeroizing<Vec<u8>>,
    metadata: Zeroizing<Vec<u8>>,
}

impl SafeContents {
    pub fn new(password: &[u8], metadata: &[u8]) -> Self {
        Self {
            password: Zeroizing::new(password.to_vec()),
            metadata: Zeroizing::new(metadata.to_vec()),
        }
    }

    pub fn parse(plaintext: &[u8]) -> Self {
        let Some(rest) = plaintext.strip_prefix(PASSWORD_PREFIX) else {
            return Self::new(b"", plaintext);
        };

        let (line, metadata) = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (rest, &b""[..]),
        };
        let password = line.strip_prefix(b" ").unwrap_or(line);
        Self::new(password, metadata)
    }

    pub fn render(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(
            RENDER_OVERHEAD + self.password.len() + self.metadata.len(),
        ));
        out.extend_from_slice(PASSWORD_PREFIX);
        out.push(b' ');
        out.extend_from_slice(&self.password);
        out.push(b'\n');
        out.extend_from_slice(&self.metadata);
        out
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Reject contents the agent could not hold
    pub fn check_bounds(&self) -> Result<(), Error> {
        if self.password.len() > PASSWORD_MAX_LEN {
            return Err(Error::InvalidInput(format!(
                "password is {} bytes long, at most {} allowed",
                self.password.len(),
                PASSWORD_MAX_LEN
            )));
        }
        if self.metadata.len() > METADATA_MAX_LEN {
            return Err(Error::InvalidInput(format!(
                "metadata is {} bytes long, at most {} allowed",
                self.metadata.len(),
                METADATA_MAX_LEN
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for SafeContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeContents")
            .field("password_len", &self.password.len())
            .field("metadata_len", &self.metadata.len())
            .finish()
    }
}
