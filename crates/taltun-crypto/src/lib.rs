//! Cryptographic primitives for the taltun data plane.
//!
//! - X25519 static identities and ECDH ([`identity`])
//! - BLAKE2s session key derivation ([`kdf`])
//! - ChaCha20-Poly1305 session cipher with in-place operations ([`aead`])
//! - Sliding-window replay protection ([`aead::replay`])
//! - Stateless HMAC cookies for handshake DoS mitigation ([`cookie`])
//!
//! Nothing in this crate touches the network or the clock beyond what the
//! cookie rotation needs; everything is deterministic given its inputs, which
//! keeps the primitives independently testable.

pub mod aead;
pub mod cookie;
pub mod identity;
pub mod kdf;
pub mod random;

use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or nonce had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AEAD open failed authentication under every available key.
    #[error("AEAD authentication failed")]
    AuthFailed,

    /// An operation required a session key that has not been installed.
    #[error("no session key installed")]
    NoSessionKey,

    /// The OS CSPRNG failed.
    #[error("OS random generator failure")]
    RandomFailed,
}
