//! Error types for the engine core.
//!
//! Two tiers: [`WireError`] for codec-level rejections, which the data plane
//! counts and drops without propagating, and [`EngineError`] for lifecycle
//! failures, the only errors that escape [`crate::engine::Engine::run`].

use thiserror::Error;

/// Codec-level packet rejection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Packet shorter than its type's minimum size.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// First byte is not a known message type.
    #[error("unknown message type: {0:#04x}")]
    InvalidType(u8),

    /// Encoding destination buffer cannot hold the message.
    #[error("encode buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A fixed-size field had the wrong length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidField {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Errors that terminate the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cryptographic setup failed (identity load, cookie secrets).
    #[error("crypto error: {0}")]
    Crypto(#[from] taltun_crypto::CryptoError),

    /// TUN device creation or configuration failed.
    #[error("TUN setup failed: {0}")]
    TunSetup(#[source] std::io::Error),

    /// UDP socket creation failed.
    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),

    /// Unrecoverable I/O error on a running worker, outside shutdown.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker thread panicked.
    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),
}

/// Result alias for engine lifecycle operations.
pub type Result<T> = std::result::Result<T, EngineError>;
