//! TUN device contract consumed by the engine.
//!
//! The engine is written against this trait rather than a concrete device
//! so the pipeline can run end-to-end in tests with an in-memory device.
//! The production implementation is [`taltun_net::TunDevice`].

use std::io;

/// Batched, headroom-aware TUN packet I/O.
///
/// Both directions carry an `offset`: packet payload starts `offset` bytes
/// into each buffer, leaving room for wire or driver headers to be stamped
/// in place.
pub trait TunIo: Send + Sync {
    /// Read up to `bufs.len()` packets, writing packet `i` at
    /// `bufs[i][offset..]` and its length into `sizes[i]`.
    ///
    /// May block briefly; implementations return `Ok(0)` periodically so
    /// the calling worker can observe shutdown.
    ///
    /// # Errors
    ///
    /// Fatal device errors only; transient emptiness is `Ok(0)`.
    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize>;

    /// Write a batch of packets whose payloads start at `packet[offset..]`.
    /// Returns how many were accepted; packets the device cannot take are
    /// dropped, as inner IP loss is acceptable.
    ///
    /// # Errors
    ///
    /// Fatal device errors only.
    fn write_batch(&self, packets: &[&[u8]], offset: usize) -> io::Result<usize>;
}

impl TunIo for taltun_net::TunDevice {
    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        taltun_net::TunDevice::read_batch(self, bufs, sizes, offset)
    }

    fn write_batch(&self, packets: &[&[u8]], offset: usize) -> io::Result<usize> {
        taltun_net::TunDevice::write_batch(self, packets, offset)
    }
}
