//! Linux TUN device with batched, headroom-aware packet I/O.
//!
//! The device is opened through `/dev/net/tun` with `IFF_TUN | IFF_NO_PI`
//! (raw IP packets, no protocol-info prefix) and put into non-blocking mode.
//! `read_batch` waits with `poll(2)` for up to 50 ms, then drains as many
//! packets as are immediately available, so a blocked TUN worker wakes
//! regularly to observe engine shutdown.
//!
//! Reads and writes take an `offset`: packet bytes start `offset` bytes into
//! each buffer, leaving headroom the caller uses to stamp wire headers
//! without copying.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// How long one `read_batch` call waits for the first packet.
const POLL_TIMEOUT_MS: libc::c_int = 50;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
}

/// An open TUN interface.
pub struct TunDevice {
    file: File,
    name: String,
}

impl TunDevice {
    /// Create (or attach to) the TUN interface `name`.
    ///
    /// The interface is created down and unaddressed; see
    /// [`crate::route::configure_interface`].
    ///
    /// # Errors
    ///
    /// Fails if `/dev/net/tun` cannot be opened (missing module or
    /// privileges), the name is too long, or the `TUNSETIFF` ioctl is
    /// rejected.
    pub fn create(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut req = IfReqFlags {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        // SAFETY: fd is a freshly opened /dev/net/tun; req is a valid,
        // fully initialized ifreq-compatible struct.
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) } < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(file.as_raw_fd())?;

        tracing::info!(interface = name, "TUN device created");
        Ok(Self {
            file,
            name: name.to_string(),
        })
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read up to `bufs.len()` packets from the interface.
    ///
    /// Packet `i` is written at `bufs[i][offset..]` and its length stored in
    /// `sizes[i]`. Waits at most 50 ms for the first packet; returns `Ok(0)`
    /// if none arrived.
    ///
    /// # Errors
    ///
    /// Any read failure other than `EAGAIN`/`EINTR`.
    pub fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        if !self.wait_readable(POLL_TIMEOUT_MS)? {
            return Ok(0);
        }

        let fd = self.file.as_raw_fd();
        let count = bufs.len().min(sizes.len());
        let mut filled = 0;

        while filled < count {
            let buf = &mut bufs[filled];
            if buf.len() <= offset {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "buffer smaller than headroom",
                ));
            }
            let room = buf.len() - offset;
            // SAFETY: the destination range buf[offset..] is valid writable
            // memory of length room.
            let ret = unsafe {
                libc::read(fd, buf[offset..].as_mut_ptr().cast(), room)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    // Drained everything that was immediately available.
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => break,
                    _ => return Err(err),
                }
            }
            sizes[filled] = ret as usize;
            filled += 1;
        }
        Ok(filled)
    }

    /// Write a batch of packets to the interface.
    ///
    /// Each packet's payload starts at `packet[offset..]`. Packets the
    /// kernel's queue cannot take right now are dropped (TUN has no
    /// backpressure an IP data plane could honor). Returns how many packets
    /// were written.
    ///
    /// # Errors
    ///
    /// Any write failure other than `EAGAIN`/`EINTR`.
    pub fn write_batch(&self, packets: &[&[u8]], offset: usize) -> io::Result<usize> {
        let fd = self.file.as_raw_fd();
        let mut written = 0;
        for packet in packets {
            if packet.len() <= offset {
                continue;
            }
            let payload = &packet[offset..];
            // SAFETY: payload is a valid readable slice.
            let ret = unsafe { libc::write(fd, payload.as_ptr().cast(), payload.len()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
            written += 1;
        }
        Ok(written)
    }

    fn wait_readable(&self, timeout_ms: libc::c_int) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(false),
                _ => Err(err),
            };
        }
        Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice").field("name", &self.name).finish()
    }
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    // SAFETY: plain fcntl on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Creating a real TUN interface needs CAP_NET_ADMIN; exercised in
    // privileged environments only.
    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn test_create_and_poll_empty() {
        let tun = TunDevice::create("taltun-test0").unwrap();
        let mut bufs = vec![vec![0u8; 2048]; 4];
        let mut sizes = vec![0usize; 4];
        // Nothing routed at the interface yet; read must time out cleanly.
        let n = tun.read_batch(&mut bufs, &mut sizes, 16).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_name_length_guard() {
        let err = TunDevice::create("this-interface-name-is-far-too-long").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
