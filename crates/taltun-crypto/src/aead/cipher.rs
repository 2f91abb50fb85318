//! ChaCha20-Poly1305 session cipher.
//!
//! Provides IETF ChaCha20-Poly1305 with:
//! - 256-bit keys (output of [`crate::kdf`])
//! - 96-bit counter nonces (fixed 4-byte prefix + 8-byte big-endian counter)
//! - 128-bit authentication tags, handled detached
//! - In-place encryption/decryption for zero-copy buffer reuse
//!
//! Decryption verifies the Poly1305 tag before touching the buffer, so a
//! failed open leaves the ciphertext intact and a second key can be tried on
//! the same bytes (see the dual-key acceptance in the session layer).

use crate::CryptoError;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use zeroize::Zeroize;

/// Session key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// Fixed prefix occupying the first 4 nonce bytes of every data packet.
///
/// The remaining 8 bytes carry the sender's packet counter; the receiver
/// reads them back as the replay sequence number.
pub const NONCE_PREFIX: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

/// Build a data-packet nonce from a sender counter.
#[must_use]
pub fn data_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&NONCE_PREFIX);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// A ChaCha20-Poly1305 AEAD handle for one session key.
///
/// Cloning is cheap (copies the expanded key) and is how the session layer
/// hands snapshots of the current key to the data-plane workers.
#[derive(Clone)]
pub struct SessionCipher {
    inner: ChaCha20Poly1305,
}

impl SessionCipher {
    /// Instantiate a cipher from a derived 32-byte session key. The key
    /// bytes are wiped once the cipher's key schedule owns them.
    #[must_use]
    pub fn new(mut key: [u8; KEY_SIZE]) -> Self {
        let inner = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { inner }
    }

    /// Encrypt `buf` in place and return the detached authentication tag.
    ///
    /// An empty `buf` is valid and produces a tag-only packet (keepalive).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `nonce` is not 12 bytes.
    pub fn seal_in_place(&self, nonce: &[u8], buf: &mut [u8]) -> Result<[u8; TAG_SIZE], CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }
        let tag = self
            .inner
            .encrypt_in_place_detached(Nonce::from_slice(nonce), &[], buf)
            .map_err(|_| CryptoError::AuthFailed)?;
        Ok(tag.into())
    }

    /// Verify `tag` over `buf` and decrypt `buf` in place.
    ///
    /// On failure the buffer is untouched, so the caller may retry with a
    /// different key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthFailed`] if the tag does not verify, or
    /// [`CryptoError::InvalidKeyLength`] if `nonce`/`tag` have wrong sizes.
    pub fn open_in_place(&self, nonce: &[u8], buf: &mut [u8], tag: &[u8]) -> Result<(), CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: TAG_SIZE,
                actual: tag.len(),
            });
        }
        self.inner
            .decrypt_in_place_detached(Nonce::from_slice(nonce), &[], buf, Tag::from_slice(tag))
            .map_err(|_| CryptoError::AuthFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(byte: u8) -> SessionCipher {
        SessionCipher::new([byte; KEY_SIZE])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher(1);
        let nonce = data_nonce(7);
        let mut buf = *b"a hundred flowers bloom";
        let tag = c.seal_in_place(&nonce, &mut buf).unwrap();
        assert_ne!(&buf[..], b"a hundred flowers bloom");

        c.open_in_place(&nonce, &mut buf, &tag).unwrap();
        assert_eq!(&buf[..], b"a hundred flowers bloom");
    }

    #[test]
    fn test_empty_payload_keepalive() {
        let c = cipher(2);
        let nonce = data_nonce(1);
        let mut buf = [0u8; 0];
        let tag = c.seal_in_place(&nonce, &mut buf).unwrap();
        c.open_in_place(&nonce, &mut buf, &tag).unwrap();
    }

    #[test]
    fn test_wrong_key_fails_and_preserves_buffer() {
        let good = cipher(3);
        let bad = cipher(4);
        let nonce = data_nonce(9);
        let mut buf = *b"payload";
        let tag = good.seal_in_place(&nonce, &mut buf).unwrap();
        let ciphertext = buf;

        let err = bad.open_in_place(&nonce, &mut buf, &tag).unwrap_err();
        assert_eq!(err, CryptoError::AuthFailed);
        // Failed open must leave the ciphertext intact for a retry.
        assert_eq!(buf, ciphertext);

        good.open_in_place(&nonce, &mut buf, &tag).unwrap();
        assert_eq!(&buf[..], b"payload");
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let c = cipher(5);
        let nonce = data_nonce(2);
        let mut buf = *b"data";
        let mut tag = c.seal_in_place(&nonce, &mut buf).unwrap();
        tag[0] ^= 0x80;
        assert_eq!(
            c.open_in_place(&nonce, &mut buf, &tag),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_data_nonce_layout() {
        let nonce = data_nonce(0x0102_0304_0506_0708);
        assert_eq!(&nonce[..4], &NONCE_PREFIX);
        assert_eq!(&nonce[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // Receiver recovers the counter from the trailing 8 bytes.
        let mut ctr = [0u8; 8];
        ctr.copy_from_slice(&nonce[4..]);
        assert_eq!(u64::from_be_bytes(ctr), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_bad_nonce_length() {
        let c = cipher(6);
        let mut buf = [0u8; 4];
        assert!(c.seal_in_place(&[0u8; 8], &mut buf).is_err());
    }
}
