//! Runtime configuration consumed by the engine.
//!
//! These are the validated, strongly typed values; file parsing and flag
//! merging live in the binary crate.

use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};

/// Operating mode of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Regular mesh member with a TUN interface.
    Client,
    /// Same data plane as a client; conventionally the node with a stable
    /// address that others dial first.
    Server,
    /// Relay-and-signal node: no TUN interface, no TUN workers.
    Lighthouse,
}

impl Mode {
    /// Whether this mode carries a TUN device.
    #[must_use]
    pub fn has_tun(self) -> bool {
        !matches!(self, Mode::Lighthouse)
    }
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: Mode,
    /// UDP listen address shared by all RX sockets via SO_REUSEPORT.
    pub local_bind: SocketAddr,
    /// TUN interface name (unused in lighthouse mode).
    pub tun_name: String,
    /// TUN MTU.
    pub mtu: usize,
    /// Static X25519 private key.
    pub secret_key: [u8; 32],
    /// This node's virtual IP inside the overlay.
    pub local_vip: Ipv4Addr,
    /// Kernel routes to install pointing at the TUN interface.
    pub routes: Vec<Ipv4Net>,
    /// Verbose data-plane logging.
    pub debug: bool,
}

/// Per-peer startup configuration.
#[derive(Debug, Clone)]
pub struct PeerSetup {
    /// The peer's virtual IP.
    pub vip: Ipv4Addr,
    /// Initial UDP endpoint, when known out-of-band.
    pub endpoint: Option<SocketAddr>,
    /// Prefixes routed to this peer (its own /32 is implicit).
    pub allowed_ips: Vec<Ipv4Net>,
}
