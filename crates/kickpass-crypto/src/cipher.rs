//! ChaCha20-Poly1305 authenticated encryption keyed from a passphrase
//!
//! Keys come from PBKDF2-HMAC-SHA256 over the master passphrase with a
//! per-write random salt. Every write also draws a fresh nonce, so the
//! same plaintext never produces the same ciphertext twice.

use std::num::NonZeroU32;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use zeroize::Zeroizing;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;
/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// 128-bit salt (16 bytes)
pub const SALT_SIZE: usize = 16;
/// Poly1305 tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed - wrong passphrase, or data corrupted or tampered")]
    AuthenticationFailed,

    #[error("Malformed safe file: {0}")]
    Malformed(&'static str),

    #[error("Unsupported safe file version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported algorithm identifier {0}")]
    UnsupportedAlgorithm(u8),

    #[error("Plaintext too large: {len} bytes, at most {max} allowed")]
    TooLarge { len: usize, max: usize },

    #[error("System random generator unavailable")]
    Rng,
}

impl CipherError {
    /// True for every failure that means "this file cannot be trusted":
    /// bad tag, bad header or an unknown format.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CipherError::AuthenticationFailed
                | CipherError::Malformed(_)
                | CipherError::UnsupportedVersion(_)
                | CipherError::UnsupportedAlgorithm(_)
        )
    }
}

/// Fill `buf` from the system CSPRNG
pub fn fill_random(buf: &mut [u8]) -> Result<(), CipherError> {
    SystemRandom::new().fill(buf).map_err(|_| CipherError::Rng)
}

/// Generate a fresh salt
pub fn generate_salt() -> Result<[u8; SALT_SIZE], CipherError> {
    let mut salt = [0u8; SALT_SIZE];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Generate a fresh nonce
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE], CipherError> {
    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// Derive the file key from the master passphrase
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8],
    iterations: NonZeroU32,
) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.expose_secret().as_bytes(),
        &mut key[..],
    );
    key
}

/// Encrypt plaintext with ChaCha20-Poly1305, authenticating `aad` alongside it
///
/// Returns: ciphertext || tag
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::EncryptionFailed)?;

    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CipherError::EncryptionFailed)
}

/// Decrypt ciphertext produced by encrypt()
///
/// Expects: ciphertext || tag
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CipherError::Malformed("ciphertext shorter than tag"));
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::AuthenticationFailed)?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::AuthenticationFailed)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iterations() -> NonZeroU32 {
        NonZeroU32::new(1_000).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let passphrase = SecretString::new("correct horse".to_string());
        let salt = generate_salt().unwrap();
        let nonce = generate_nonce().unwrap();
        let key = derive_key(&passphrase, &salt, iterations());
        let plaintext = b"password: hunter2\nurl: example.org\n";

        let ciphertext = encrypt(&key, &nonce, b"header", plaintext).unwrap();

        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
        assert_ne!(&ciphertext[..plaintext.len()], plaintext);

        let decrypted = decrypt(&key, &nonce, b"header", &ciphertext).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = derive_key(&SecretString::new("pw".into()), &[0u8; SALT_SIZE], iterations());
        let nonce = generate_nonce().unwrap();

        let mut ciphertext = encrypt(&key, &nonce, b"", b"secret data").unwrap();
        if let Some(byte) = ciphertext.last_mut() {
            *byte ^= 0xFF;
        }

        assert!(matches!(
            decrypt(&key, &nonce, b"", &ciphertext),
            Err(CipherError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_aad_fails() {
        let key = derive_key(&SecretString::new("pw".into()), &[0u8; SALT_SIZE], iterations());
        let nonce = generate_nonce().unwrap();

        let ciphertext = encrypt(&key, &nonce, b"v1", b"secret data").unwrap();

        assert!(matches!(
            decrypt(&key, &nonce, b"v2", &ciphertext),
            Err(CipherError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let salt = generate_salt().unwrap();
        let nonce = generate_nonce().unwrap();
        let key1 = derive_key(&SecretString::new("one".into()), &salt, iterations());
        let key2 = derive_key(&SecretString::new("two".into()), &salt, iterations());

        let ciphertext = encrypt(&key1, &nonce, b"", b"secret data").unwrap();

        assert!(decrypt(&key2, &nonce, b"", &ciphertext).is_err());
    }

    #[test]
    fn test_key_derivation_depends_on_salt() {
        let passphrase = SecretString::new("same".into());
        let a = derive_key(&passphrase, &[1u8; SALT_SIZE], iterations());
        let b = derive_key(&passphrase, &[2u8; SALT_SIZE], iterations());
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_short_ciphertext_is_malformed() {
        let key = [0u8; KEY_SIZE];
        let nonce = [0u8; NONCE_SIZE];
        assert!(matches!(
            decrypt(&key, &nonce, b"", &[0u8; TAG_SIZE - 1]),
            Err(CipherError::Malformed(_))
        ));
    }
}
