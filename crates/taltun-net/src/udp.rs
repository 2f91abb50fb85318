//! SO_REUSEPORT UDP sockets with vectorized batch I/O.
//!
//! Multiple sockets bind the same port with SO_REUSEPORT so the kernel
//! spreads inbound flows across the RX workers by source-address hash.
//! Batched reads and writes go through `recvmmsg`/`sendmmsg`, one syscall
//! per batch of up to [`MAX_BATCH`] datagrams.
//!
//! Sockets carry a short receive timeout. A blocked `recv_batch` therefore
//! wakes every 50 ms and returns `Ok(0)`, which is how the RX workers poll
//! the engine's shutdown flag without a wakeup pipe.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Maximum datagrams moved by one batched syscall.
pub const MAX_BATCH: usize = 64;

/// Receive timeout; bounds the shutdown latency of a blocked RX worker.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Source address and payload length of one received datagram.
#[derive(Clone, Copy, Debug)]
pub struct RecvMeta {
    pub len: usize,
    pub addr: SocketAddr,
}

impl Default for RecvMeta {
    fn default() -> Self {
        Self {
            len: 0,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

/// A UDP socket bound with SO_REUSEPORT, doing vectorized batch I/O.
pub struct UdpBatchSocket {
    sock: Socket,
}

impl UdpBatchSocket {
    /// Bind a new socket to `addr` with SO_REUSEPORT and SO_REUSEADDR set,
    /// allowing several sockets to share one port.
    ///
    /// # Errors
    ///
    /// Any socket creation, option, or bind failure.
    pub fn bind_reuseport(addr: SocketAddr) -> io::Result<Self> {
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_reuse_port(true)?;
        sock.set_read_timeout(Some(READ_TIMEOUT))?;
        sock.bind(&addr.into())?;
        Ok(Self { sock })
    }

    /// The local address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Propagates `getsockname` failures.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    /// Receive up to `bufs.len()` datagrams in one `recvmmsg` call.
    ///
    /// Each datagram `i` lands at the start of `bufs[i]`; its length and
    /// source address are written to `metas[i]`. Returns the number of
    /// datagrams received, or `Ok(0)` on receive timeout or signal
    /// interruption.
    ///
    /// # Errors
    ///
    /// Any `recvmmsg` failure other than timeout/interruption.
    pub fn recv_batch(&self, bufs: &mut [Vec<u8>], metas: &mut [RecvMeta]) -> io::Result<usize> {
        let count = bufs.len().min(metas.len()).min(MAX_BATCH);
        if count == 0 {
            return Ok(0);
        }

        // SAFETY: all-zero iovec/mmsghdr/sockaddr_storage are valid initial
        // states for the kernel interfaces below.
        let mut iovecs: [libc::iovec; MAX_BATCH] = unsafe { mem::zeroed() };
        let mut names: [libc::sockaddr_storage; MAX_BATCH] = unsafe { mem::zeroed() };
        let mut hdrs: [libc::mmsghdr; MAX_BATCH] = unsafe { mem::zeroed() };

        for i in 0..count {
            iovecs[i].iov_base = bufs[i].as_mut_ptr().cast();
            iovecs[i].iov_len = bufs[i].len();
            hdrs[i].msg_hdr.msg_iov = &mut iovecs[i];
            hdrs[i].msg_hdr.msg_iovlen = 1;
            hdrs[i].msg_hdr.msg_name = (&mut names[i] as *mut libc::sockaddr_storage).cast();
            hdrs[i].msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }

        // SAFETY: hdrs[..count] reference live iovecs pointing into bufs,
        // which outlive the call; name buffers are sized sockaddr_storage.
        let n = unsafe {
            libc::recvmmsg(
                self.sock.as_raw_fd(),
                hdrs.as_mut_ptr(),
                count as libc::c_uint,
                libc::MSG_WAITFORONE,
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(0)
                }
                _ => Err(err),
            };
        }

        let n = n as usize;
        for i in 0..n {
            metas[i].len = hdrs[i].msg_len as usize;
            metas[i].addr = sockaddr_to_std(&names[i])
                .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        }
        Ok(n)
    }

    /// Send a batch of datagrams, each to its own destination, in one
    /// `sendmmsg` call. Returns how many were handed to the kernel.
    ///
    /// # Errors
    ///
    /// Any `sendmmsg` failure; `Ok(0)` on signal interruption.
    pub fn send_batch(&self, packets: &[(&[u8], SocketAddr)]) -> io::Result<usize> {
        let count = packets.len().min(MAX_BATCH);
        if count == 0 {
            return Ok(0);
        }

        let addrs: Vec<SockAddr> = packets[..count]
            .iter()
            .map(|(_, addr)| SockAddr::from(*addr))
            .collect();

        // SAFETY: zeroed iovec/mmsghdr are valid initial states.
        let mut iovecs: [libc::iovec; MAX_BATCH] = unsafe { mem::zeroed() };
        let mut hdrs: [libc::mmsghdr; MAX_BATCH] = unsafe { mem::zeroed() };

        for i in 0..count {
            // sendmsg never writes through iov_base; the cast to *mut is an
            // artifact of the shared iovec type.
            iovecs[i].iov_base = packets[i].0.as_ptr() as *mut libc::c_void;
            iovecs[i].iov_len = packets[i].0.len();
            hdrs[i].msg_hdr.msg_iov = &mut iovecs[i];
            hdrs[i].msg_hdr.msg_iovlen = 1;
            hdrs[i].msg_hdr.msg_name = addrs[i].as_ptr() as *mut libc::c_void;
            hdrs[i].msg_hdr.msg_namelen = addrs[i].len();
        }

        // SAFETY: hdrs[..count] reference live iovecs and addresses that
        // outlive the call.
        let n = unsafe {
            libc::sendmmsg(
                self.sock.as_raw_fd(),
                hdrs.as_mut_ptr(),
                count as libc::c_uint,
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        Ok(n as usize)
    }

    /// Send a single datagram (control-plane path).
    ///
    /// # Errors
    ///
    /// Any `sendto` failure.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sock.send_to(data, &SockAddr::from(addr))
    }
}

impl std::fmt::Debug for UdpBatchSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpBatchSocket")
            .field("local", &self.local_addr().ok())
            .finish()
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // SAFETY: family checked; sockaddr_in fits inside sockaddr_storage.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: family checked; sockaddr_in6 fits inside sockaddr_storage.
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
