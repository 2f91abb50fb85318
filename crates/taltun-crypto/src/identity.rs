//! X25519 static node identities.
//!
//! Every node carries one long-term X25519 key pair. The private key is
//! supplied out-of-band (configuration) and never leaves this type; the
//! public key travels in handshake messages. Session keys are derived from
//! the raw ECDH output by [`crate::kdf`].

use crate::{random, CryptoError};
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of X25519 private keys, public keys, and shared secrets.
pub const KEY_SIZE: usize = 32;

/// A long-term X25519 identity key pair.
///
/// The secret half is zeroized on drop by `x25519_dalek`.
pub struct StaticIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticIdentity {
    /// Load an identity from a 32-byte private key.
    #[must_use]
    pub fn from_private_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Generate a fresh random identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_private_bytes(random::random_32()?))
    }

    /// The public key bytes, as carried in handshake messages.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Compute the raw ECDH shared secret with a peer's public key.
    ///
    /// The output must not be used directly as a symmetric key; run it
    /// through [`crate::kdf::derive_session_key`] first.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `peer_public` is not
    /// exactly 32 bytes.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
        if peer_public.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: peer_public.len(),
            });
        }
        let mut pk = [0u8; KEY_SIZE];
        pk.copy_from_slice(peer_public);
        let shared = self.secret.diffie_hellman(&PublicKey::from(pk));
        Ok(shared.to_bytes())
    }
}
