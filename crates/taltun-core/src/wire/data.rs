//! DATA packet header encoding and decoding (17 bytes).
//!
//! ```text
//!  Offset  Size  Field
//!  0       1     Type (0x03)
//!  1       4     Sender VIP (big-endian)
//!  5       12    Nonce (4-byte fixed prefix + 8-byte big-endian counter)
//!  17      ..    Ciphertext + tag
//! ```

use super::MSG_DATA;
use crate::error::WireError;

/// DATA header size on the wire.
pub const HEADER_SIZE: usize = 17;

/// Nonce size carried in the DATA header.
pub const NONCE_SIZE: usize = taltun_crypto::aead::NONCE_SIZE;

// The header layout hard-codes a 12-byte nonce.
const _: () = assert!(NONCE_SIZE == 12);
const _: () = assert!(HEADER_SIZE == 1 + 4 + NONCE_SIZE);

/// Borrowed view of a parsed DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    /// Virtual IP of the sender, keying the peer lookup.
    pub sender_vip: u32,
    /// The 12-byte nonce; its trailing 8 bytes are the replay counter.
    pub nonce: &'a [u8],
    /// Ciphertext followed by the 16-byte authentication tag.
    pub ciphertext: &'a [u8],
}

impl DataPacket<'_> {
    /// The replay counter carried in the nonce.
    #[must_use]
    pub fn counter(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.nonce[4..12]);
        u64::from_be_bytes(bytes)
    }
}

/// Stamp a DATA header into the first 17 bytes of `dst`.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] if `dst` is shorter than the
/// header, or [`WireError::InvalidField`] for a wrong-sized nonce.
pub fn encode_data_header(
    dst: &mut [u8],
    sender_vip: u32,
    nonce: &[u8],
) -> Result<usize, WireError> {
    if dst.len() < HEADER_SIZE {
        return Err(WireError::BufferTooSmall {
            needed: HEADER_SIZE,
            available: dst.len(),
        });
    }
    if nonce.len() != NONCE_SIZE {
        return Err(WireError::InvalidField {
            field: "nonce",
            expected: NONCE_SIZE,
            actual: nonce.len(),
        });
    }

    dst[0] = MSG_DATA;
    dst[1..5].copy_from_slice(&sender_vip.to_be_bytes());
    dst[5..HEADER_SIZE].copy_from_slice(nonce);
    Ok(HEADER_SIZE)
}

/// Parse a DATA packet without copying.
///
/// # Errors
///
/// Returns [`WireError::InvalidType`] if the type byte is not `0x03`, or
/// [`WireError::TooShort`] if the packet cannot hold the header.
pub fn parse_data(src: &[u8]) -> Result<DataPacket<'_>, WireError> {
    if src.is_empty() {
        return Err(WireError::TooShort {
            expected: HEADER_SIZE,
            actual: 0,
        });
    }
    if src[0] != MSG_DATA {
        return Err(WireError::InvalidType(src[0]));
    }
    if src.len() < HEADER_SIZE {
        return Err(WireError::TooShort {
            expected: HEADER_SIZE,
            actual: src.len(),
        });
    }

    Ok(DataPacket {
        sender_vip: u32::from_be_bytes([src[1], src[2], src[3], src[4]]),
        nonce: &src[5..HEADER_SIZE],
        ciphertext: &src[HEADER_SIZE..],
    })
}
