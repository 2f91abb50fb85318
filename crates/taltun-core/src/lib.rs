//! Core of the taltun mesh VPN data plane.
//!
//! Taltun moves encrypted IPv4 datagrams between mesh nodes over UDP. Each
//! node owns a virtual IP and an X25519 identity; packets are authenticated
//! with per-peer session keys, replay-filtered, and routed by inner
//! destination: to the local TUN, relayed to another peer, or handed to
//! the kernel as a gateway. Lighthouse nodes relay between NAT-ed clients
//! and signal observed endpoints so the clients can promote to direct
//! paths.
//!
//! This crate contains everything above the OS: the wire codec ([`wire`]),
//! the buffer and batch pools ([`buffer_pool`], [`batch`]), per-peer
//! session state ([`peer`]), the copy-on-write peer map ([`peer_map`]) and
//! LPM router ([`router`]), and the worker pipeline ([`engine`]). OS glue
//! (TUN, sockets, routes) lives in `taltun-net` behind the [`device`]
//! contract.

pub mod batch;
pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod ipv4;
pub mod peer;
pub mod peer_map;
pub mod router;
pub mod wire;

pub use config::{EngineConfig, Mode, PeerSetup};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result, WireError};
