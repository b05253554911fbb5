//! Kickpass Crypto - Encryption layer for password safes
//!
//! This crate provides:
//! - ChaCha20-Poly1305 authenticated encryption with PBKDF2 key derivation
//! - The self-describing safe file format
//! - Guarded (locked, zero-on-free) memory for cached secrets

pub mod cipher;
pub mod envelope;
pub mod guarded;

pub use cipher::CipherError;
pub use envelope::{engine, open, seal, version};
pub use guarded::{GuardedBuf, GuardedError};
