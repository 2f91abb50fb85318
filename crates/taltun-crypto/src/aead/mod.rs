//! Authenticated encryption for the data plane.
//!
//! [`cipher`] wraps ChaCha20-Poly1305 with in-place detached operations so
//! the engine can encrypt and decrypt inside pooled packet buffers without
//! copying. [`replay`] is the per-peer anti-replay window applied to the
//! nonce counter of accepted packets.

pub mod cipher;
pub mod replay;

pub use cipher::{data_nonce, SessionCipher, KEY_SIZE, NONCE_PREFIX, NONCE_SIZE, TAG_SIZE};
pub use replay::ReplayFilter;
