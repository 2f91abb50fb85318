//! TX batching: encrypted packets accumulated for vectorized UDP sends.
//!
//! A [`TxBatch`] carries up to [`BATCH_SIZE`] requests; each request owns
//! one pooled buffer. Ownership travels with the batch through the TX
//! queue; whoever consumes a batch (normally the UDP write worker, or the
//! producer itself when the queue is full) must release every buffer and
//! return the batch shell to the batch pool.

use crate::buffer_pool::BufferPool;
use crossbeam_queue::ArrayQueue;
use std::net::SocketAddr;
use std::sync::OnceLock;

/// Packets read or written per batched syscall, and the request capacity of
/// one TX batch.
pub const BATCH_SIZE: usize = 64;

/// Batch shells kept by the process-wide batch pool.
const BATCH_POOL_CAPACITY: usize = 512;

/// One encrypted packet ready to send.
#[derive(Debug)]
pub struct TxRequest {
    /// Pooled buffer holding the wire packet at its start.
    pub buf: Vec<u8>,
    /// Wire packet length within `buf`.
    pub len: usize,
    /// Destination endpoint.
    pub addr: SocketAddr,
}

/// A batch of TX requests bound for the UDP write worker.
#[derive(Debug, Default)]
pub struct TxBatch {
    reqs: Vec<TxRequest>,
}

impl TxBatch {
    /// An empty batch with full capacity reserved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reqs: Vec::with_capacity(BATCH_SIZE),
        }
    }

    /// Append a request. Callers check [`Self::is_full`] first; a request
    /// pushed past capacity only costs a reallocation, not a loss.
    pub fn push(&mut self, req: TxRequest) {
        self.reqs.push(req);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.reqs.len() >= BATCH_SIZE
    }

    /// The queued requests.
    #[must_use]
    pub fn requests(&self) -> &[TxRequest] {
        &self.reqs
    }

    /// Release every owned buffer back to `pool` and empty the batch.
    pub fn release_buffers(&mut self, pool: &BufferPool) {
        for req in self.reqs.drain(..) {
            pool.release(req.buf);
        }
    }
}

/// Pool of reusable batch shells.
pub struct BatchPool {
    queue: ArrayQueue<TxBatch>,
}

impl BatchPool {
    #[must_use]
    fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Take an empty batch, allocating one if the pool is dry.
    #[must_use]
    pub fn acquire(&self) -> TxBatch {
        self.queue.pop().unwrap_or_else(TxBatch::new)
    }

    /// Return an emptied batch shell.
    ///
    /// # Panics
    ///
    /// Debug-asserts that all buffers were released first.
    pub fn release(&self, batch: TxBatch) {
        debug_assert!(batch.is_empty(), "batch returned with live buffers");
        let _ = self.queue.push(batch);
    }
}

/// The process-wide batch pool, created on first use.
pub fn global() -> &'static BatchPool {
    static POOL: OnceLock<BatchPool> = OnceLock::new();
    POOL.get_or_init(|| BatchPool::with_capacity(BATCH_POOL_CAPACITY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000))
    }

    #[test]
    fn test_batch_fill_and_release() {
        let bufs = BufferPool::with_capacity(BATCH_SIZE);
        let mut batch = TxBatch::new();

        for _ in 0..BATCH_SIZE {
            assert!(!batch.is_full());
            batch.push(TxRequest {
                buf: bufs.acquire(),
                len: 100,
                addr: addr(),
            });
        }
        assert!(batch.is_full());
        assert_eq!(batch.len(), BATCH_SIZE);
        assert_eq!(bufs.available(), 0);

        // Dropping a batch must return every buffer it owns.
        batch.release_buffers(&bufs);
        assert!(batch.is_empty());
        assert_eq!(bufs.available(), BATCH_SIZE);
    }

    #[test]
    fn test_batch_pool_recycles_shells() {
        let pool = BatchPool::with_capacity(4);
        let batch = pool.acquire();
        pool.release(batch);
        let again = pool.acquire();
        assert!(again.is_empty());
    }
}
