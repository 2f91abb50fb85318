//! On-wire message codec.
//!
//! Five message types, all integers big-endian, no TLVs:
//!
//! ```text
//!  Type  Name            Layout                                        Size
//!  0x01  HANDSHAKE_INIT  type(1) | sender_vip(4) | pubkey(32) [| cookie(16)]  37/53
//!  0x02  HANDSHAKE_RESP  type(1) | sender_vip(4) | pubkey(32) [| cookie(16)]  37/53
//!  0x03  DATA            type(1) | sender_vip(4) | nonce(12) | ct+tag(..)     17+
//!  0x04  COOKIE_REPLY    type(1) | cookie(16)                                 17
//!  0x05  PEER_UPDATE     type(1) | target_vip(4) | ip(4) | port(2)            11
//! ```
//!
//! Parsers are zero-copy: they validate sizes and return subslices of the
//! input. There is no version byte; unknown type bytes are rejected, which
//! keeps the remaining space free for future use.

pub mod control;
pub mod data;

pub use control::{
    encode_cookie_reply, encode_handshake, encode_peer_update, parse_cookie_reply,
    parse_handshake, parse_peer_update, Handshake, PeerUpdate, COOKIE_REPLY_SIZE,
    HANDSHAKE_BASE_SIZE, HANDSHAKE_FULL_SIZE, PEER_UPDATE_SIZE,
};
pub use data::{encode_data_header, parse_data, DataPacket, HEADER_SIZE, NONCE_SIZE};

/// Handshake initiation (carries the sender's static public key).
pub const MSG_HANDSHAKE_INIT: u8 = 0x01;
/// Handshake response (same layout as the init).
pub const MSG_HANDSHAKE_RESP: u8 = 0x02;
/// Encrypted data packet.
pub const MSG_DATA: u8 = 0x03;
/// DoS cookie handed back to a rate-limited initiator.
pub const MSG_COOKIE_REPLY: u8 = 0x04;
/// Lighthouse-signaled endpoint advertisement.
pub const MSG_PEER_UPDATE: u8 = 0x05;

/// Size of a DoS cookie on the wire.
pub const COOKIE_SIZE: usize = taltun_crypto::cookie::COOKIE_SIZE;

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;
