//! Safe file format
//!
//! ```text
//! magic "KPSF" | version | kdf | aead | reserved | iterations (u32 BE) | salt | nonce | ciphertext || tag
//! ```
//!
//! The header carries everything needed to decrypt the file and is
//! authenticated as associated data, so flipping any byte of it makes
//! decryption fail exactly like flipping a ciphertext byte.

use std::num::NonZeroU32;

use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::cipher::{self, CipherError, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 4] = b"KPSF";
/// Current format version
pub const FORMAT_VERSION: u8 = 1;
/// PBKDF2-HMAC-SHA256
pub const KDF_PBKDF2_SHA256: u8 = 1;
/// ChaCha20-Poly1305
pub const AEAD_CHACHA20_POLY1305: u8 = 1;

pub const ENGINE: &str = "chacha20poly1305";

pub const HEADER_LEN: usize = MAGIC.len() + 4 + 4 + SALT_SIZE + NONCE_SIZE;

/// Default PBKDF2 work factor for new files
pub const DEFAULT_ITERATIONS: u32 = 100_000;
/// Upper bound accepted when reading, so a corrupted header cannot stall us
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Largest plaintext this layer will seal
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

/// Storage engine name reported by `version` introspection
pub fn engine() -> &'static str {
    ENGINE
}

/// Storage format version reported by `version` introspection
pub fn version() -> String {
    FORMAT_VERSION.to_string()
}

/// Parsed safe file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kdf: u8,
    pub aead: u8,
    pub iterations: NonZeroU32,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

impl Header {
    /// Fresh header for a new write: current version, new salt and nonce
    pub fn generate(iterations: NonZeroU32) -> Result<Self, CipherError> {
        Ok(Self {
            version: FORMAT_VERSION,
            kdf: KDF_PBKDF2_SHA256,
            aead: AEAD_CHACHA20_POLY1305,
            iterations,
            salt: cipher::generate_salt()?,
            nonce: cipher::generate_nonce()?,
        })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = self.version;
        out[5] = self.kdf;
        out[6] = self.aead;
        out[7] = 0;
        out[8..12].copy_from_slice(&self.iterations.get().to_be_bytes());
        out[12..12 + SALT_SIZE].copy_from_slice(&self.salt);
        out[12 + SALT_SIZE..].copy_from_slice(&self.nonce);
        out
    }

    /// Deserialize from the start of a safe file
    pub fn parse(data: &[u8]) -> Result<Self, CipherError> {
        if data.len() < HEADER_LEN {
            return Err(CipherError::Malformed("file shorter than header"));
        }
        if &data[..4] != MAGIC {
            return Err(CipherError::Malformed("bad magic"));
        }

        let version = data[4];
        if version != FORMAT_VERSION {
            return Err(CipherError::UnsupportedVersion(version));
        }
        let kdf = data[5];
        if kdf != KDF_PBKDF2_SHA256 {
            return Err(CipherError::UnsupportedAlgorithm(kdf));
        }
        let aead = data[6];
        if aead != AEAD_CHACHA20_POLY1305 {
            return Err(CipherError::UnsupportedAlgorithm(aead));
        }
        if data[7] != 0 {
            return Err(CipherError::Malformed("reserved byte set"));
        }

        let raw = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        if raw > MAX_ITERATIONS {
            return Err(CipherError::Malformed("iteration count out of range"));
        }
        let iterations =
            NonZeroU32::new(raw).ok_or(CipherError::Malformed("zero iteration count"))?;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&data[12..12 + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[12 + SALT_SIZE..HEADER_LEN]);

        Ok(Self {
            version,
            kdf,
            aead,
            iterations,
            salt,
            nonce,
        })
    }
}

/// Encrypt `plaintext` under `passphrase` into a complete safe file image
pub fn seal(
    passphrase: &SecretString,
    plaintext: &[u8],
    iterations: NonZeroU32,
) -> Result<Vec<u8>, CipherError> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(CipherError::TooLarge {
            len: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }

    let header = Header::generate(iterations)?;
    let header_bytes = header.to_bytes();
    let key = cipher::derive_key(passphrase, &header.salt, header.iterations);
    let ciphertext = cipher::encrypt(&key, &header.nonce, &header_bytes, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a safe file image produced by seal()
pub fn open(passphrase: &SecretString, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let header = Header::parse(sealed)?;
    let body = &sealed[HEADER_LEN..];
    if body.len() < TAG_SIZE {
        return Err(CipherError::Malformed("missing authentication tag"));
    }

    let key = cipher::derive_key(passphrase, &header.salt, header.iterations);
    cipher::decrypt(&key, &header.nonce, &sealed[..HEADER_LEN], body)
}
