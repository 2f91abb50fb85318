//! Control-plane message encoding and decoding.
//!
//! Handshakes carry the sender's static X25519 public key and, optionally,
//! a DoS cookie previously handed out by the responder. COOKIE_REPLY and
//! PEER_UPDATE are fixed-size.

use super::{
    COOKIE_SIZE, MSG_COOKIE_REPLY, MSG_HANDSHAKE_INIT, MSG_HANDSHAKE_RESP, MSG_PEER_UPDATE,
    PUBLIC_KEY_SIZE,
};
use crate::error::WireError;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Handshake size without a cookie.
pub const HANDSHAKE_BASE_SIZE: usize = 1 + 4 + PUBLIC_KEY_SIZE;

/// Handshake size with a cookie attached.
pub const HANDSHAKE_FULL_SIZE: usize = HANDSHAKE_BASE_SIZE + COOKIE_SIZE;

/// COOKIE_REPLY size.
pub const COOKIE_REPLY_SIZE: usize = 1 + COOKIE_SIZE;

/// PEER_UPDATE size.
pub const PEER_UPDATE_SIZE: usize = 1 + 4 + 4 + 2;

/// Borrowed view of a parsed handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake<'a> {
    /// `MSG_HANDSHAKE_INIT` or `MSG_HANDSHAKE_RESP`.
    pub msg_type: u8,
    /// Virtual IP the sender claims; authenticated by the ECDH that follows.
    pub sender_vip: u32,
    /// Sender's static X25519 public key (32 bytes).
    pub public_key: &'a [u8],
    /// DoS cookie, when the sender attached one (16 bytes).
    pub cookie: Option<&'a [u8]>,
}

/// Endpoint advertisement for a mesh peer (lighthouse extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUpdate {
    /// Which peer the advertised endpoint belongs to.
    pub target_vip: u32,
    /// Where that peer was last observed (IPv4 only).
    pub endpoint: SocketAddrV4,
}

/// Encode a handshake message, appending `cookie` when present.
///
/// # Errors
///
/// Returns [`WireError::InvalidType`] for a non-handshake type byte,
/// [`WireError::InvalidField`] for wrong-sized key or cookie, and
/// [`WireError::BufferTooSmall`] when `dst` cannot hold the message.
pub fn encode_handshake(
    dst: &mut [u8],
    msg_type: u8,
    sender_vip: u32,
    public_key: &[u8],
    cookie: Option<&[u8]>,
) -> Result<usize, WireError> {
    if msg_type != MSG_HANDSHAKE_INIT && msg_type != MSG_HANDSHAKE_RESP {
        return Err(WireError::InvalidType(msg_type));
    }
    if public_key.len() != PUBLIC_KEY_SIZE {
        return Err(WireError::InvalidField {
            field: "public key",
            expected: PUBLIC_KEY_SIZE,
            actual: public_key.len(),
        });
    }
    if let Some(cookie) = cookie {
        if cookie.len() != COOKIE_SIZE {
            return Err(WireError::InvalidField {
                field: "cookie",
                expected: COOKIE_SIZE,
                actual: cookie.len(),
            });
        }
    }

    let needed = if cookie.is_some() {
        HANDSHAKE_FULL_SIZE
    } else {
        HANDSHAKE_BASE_SIZE
    };
    if dst.len() < needed {
        return Err(WireError::BufferTooSmall {
            needed,
            available: dst.len(),
        });
    }

    dst[0] = msg_type;
    dst[1..5].copy_from_slice(&sender_vip.to_be_bytes());
    dst[5..HANDSHAKE_BASE_SIZE].copy_from_slice(public_key);
    if let Some(cookie) = cookie {
        dst[HANDSHAKE_BASE_SIZE..HANDSHAKE_FULL_SIZE].copy_from_slice(cookie);
    }
    Ok(needed)
}

/// Parse a handshake message without copying.
///
/// A trailing cookie is recognized only when the packet is long enough to
/// carry a complete one.
///
/// # Errors
///
/// Returns [`WireError::InvalidType`] or [`WireError::TooShort`].
pub fn parse_handshake(src: &[u8]) -> Result<Handshake<'_>, WireError> {
    if src.is_empty() {
        return Err(WireError::TooShort {
            expected: HANDSHAKE_BASE_SIZE,
            actual: 0,
        });
    }
    if src[0] != MSG_HANDSHAKE_INIT && src[0] != MSG_HANDSHAKE_RESP {
        return Err(WireError::InvalidType(src[0]));
    }
    if src.len() < HANDSHAKE_BASE_SIZE {
        return Err(WireError::TooShort {
            expected: HANDSHAKE_BASE_SIZE,
            actual: src.len(),
        });
    }

    let cookie = if src.len() >= HANDSHAKE_FULL_SIZE {
        Some(&src[HANDSHAKE_BASE_SIZE..HANDSHAKE_FULL_SIZE])
    } else {
        None
    };

    Ok(Handshake {
        msg_type: src[0],
        sender_vip: u32::from_be_bytes([src[1], src[2], src[3], src[4]]),
        public_key: &src[5..HANDSHAKE_BASE_SIZE],
        cookie,
    })
}

/// Encode a COOKIE_REPLY.
///
/// # Errors
///
/// Returns [`WireError::InvalidField`] or [`WireError::BufferTooSmall`].
pub fn encode_cookie_reply(dst: &mut [u8], cookie: &[u8]) -> Result<usize, WireError> {
    if cookie.len() != COOKIE_SIZE {
        return Err(WireError::InvalidField {
            field: "cookie",
            expected: COOKIE_SIZE,
            actual: cookie.len(),
        });
    }
    if dst.len() < COOKIE_REPLY_SIZE {
        return Err(WireError::BufferTooSmall {
            needed: COOKIE_REPLY_SIZE,
            available: dst.len(),
        });
    }
    dst[0] = MSG_COOKIE_REPLY;
    dst[1..COOKIE_REPLY_SIZE].copy_from_slice(cookie);
    Ok(COOKIE_REPLY_SIZE)
}

/// Parse a COOKIE_REPLY, returning the cookie bytes.
///
/// # Errors
///
/// Returns [`WireError::InvalidType`] or [`WireError::TooShort`].
pub fn parse_cookie_reply(src: &[u8]) -> Result<&[u8], WireError> {
    if src.is_empty() {
        return Err(WireError::TooShort {
            expected: COOKIE_REPLY_SIZE,
            actual: 0,
        });
    }
    if src[0] != MSG_COOKIE_REPLY {
        return Err(WireError::InvalidType(src[0]));
    }
    if src.len() < COOKIE_REPLY_SIZE {
        return Err(WireError::TooShort {
            expected: COOKIE_REPLY_SIZE,
            actual: src.len(),
        });
    }
    Ok(&src[1..COOKIE_REPLY_SIZE])
}

/// Encode a PEER_UPDATE advertising `endpoint` as `target_vip`'s location.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] when `dst` is too small.
pub fn encode_peer_update(
    dst: &mut [u8],
    target_vip: u32,
    endpoint: SocketAddrV4,
) -> Result<usize, WireError> {
    if dst.len() < PEER_UPDATE_SIZE {
        return Err(WireError::BufferTooSmall {
            needed: PEER_UPDATE_SIZE,
            available: dst.len(),
        });
    }
    dst[0] = MSG_PEER_UPDATE;
    dst[1..5].copy_from_slice(&target_vip.to_be_bytes());
    dst[5..9].copy_from_slice(&endpoint.ip().octets());
    dst[9..11].copy_from_slice(&endpoint.port().to_be_bytes());
    Ok(PEER_UPDATE_SIZE)
}

/// Parse a PEER_UPDATE.
///
/// # Errors
///
/// Returns [`WireError::InvalidType`] or [`WireError::TooShort`].
pub fn parse_peer_update(src: &[u8]) -> Result<PeerUpdate, WireError> {
    if src.is_empty() {
        return Err(WireError::TooShort {
            expected: PEER_UPDATE_SIZE,
            actual: 0,
        });
    }
    if src[0] != MSG_PEER_UPDATE {
        return Err(WireError::InvalidType(src[0]));
    }
    if src.len() < PEER_UPDATE_SIZE {
        return Err(WireError::TooShort {
            expected: PEER_UPDATE_SIZE,
            actual: src.len(),
        });
    }

    Ok(PeerUpdate {
        target_vip: u32::from_be_bytes([src[1], src[2], src[3], src[4]]),
        endpoint: SocketAddrV4::new(
            Ipv4Addr::new(src[5], src[6], src[7], src[8]),
            u16::from_be_bytes([src[9], src[10]]),
        ),
    })
}
