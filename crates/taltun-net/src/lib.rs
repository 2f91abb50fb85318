//! Linux OS glue for the taltun data plane.
//!
//! - [`tun`]: TUN device creation and batched packet I/O with headroom
//! - [`udp`]: SO_REUSEPORT UDP sockets with `recvmmsg`/`sendmmsg` batching
//! - [`route`]: interface address and kernel route installation
//!
//! All raw syscalls live here, behind safe wrappers; the engine above never
//! touches a file descriptor. Errors are plain [`std::io::Error`] so callers
//! can distinguish timeouts and shutdown races from genuine failures.

pub mod route;
pub mod tun;
pub mod udp;

pub use tun::TunDevice;
pub use udp::{RecvMeta, UdpBatchSocket, MAX_BATCH};
