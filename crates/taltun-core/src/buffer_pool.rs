//! Process-wide pool of fixed-size packet buffers.
//!
//! Every packet the data plane touches lives in a 2048-byte buffer from
//! this pool: large enough for a 1500-byte MTU plus wire headers, small
//! enough to keep the working set cache-friendly. The pool is a lock-free
//! `ArrayQueue`; exhaustion falls back to a fresh allocation so acquisition
//! never blocks.
//!
//! Ownership rule: a buffer is either idle in the pool or held by exactly
//! one owner, and every acquired buffer must be released exactly once on
//! every path (success, error, drop). This is the data plane's central
//! correctness invariant; the unit tests below and the engine integration
//! tests count buffers across full pipelines to enforce it.

use crossbeam_queue::ArrayQueue;
use std::sync::OnceLock;

/// Fixed size of every pooled buffer.
pub const BUFFER_SIZE: usize = 2048;

/// Buffers pre-allocated by the process-wide pool.
const POOL_CAPACITY: usize = 1024;

/// A lock-free pool of pre-allocated packet buffers.
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` buffers, all pre-allocated.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(vec![0u8; BUFFER_SIZE]);
        }
        Self { queue }
    }

    /// Take a buffer from the pool, allocating if the pool is empty.
    ///
    /// The returned buffer always has length [`BUFFER_SIZE`].
    #[must_use]
    pub fn acquire(&self) -> Vec<u8> {
        self.queue.pop().unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is restored to [`BUFFER_SIZE`] length. If the pool is
    /// already full the buffer is simply freed.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(BUFFER_SIZE, 0);
        let _ = self.queue.push(buf);
    }

    /// Buffers currently idle in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.queue.len()
    }
}

/// The process-wide pool, created on first use.
pub fn global() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::with_capacity(POOL_CAPACITY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_balanced() {
        let pool = BufferPool::with_capacity(8);
        assert_eq!(pool.available(), 8);

        let buf = pool.acquire();
        assert_eq!(buf.len(), BUFFER_SIZE);
        assert_eq!(pool.available(), 7);

        pool.release(buf);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_exhaustion_falls_back_to_allocation() {
        let pool = BufferPool::with_capacity(1);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(b.len(), BUFFER_SIZE);
        assert_eq!(pool.available(), 0);
        pool.release(a);
        pool.release(b);
        // Second release overflows the capacity and is dropped.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_restores_size() {
        let pool = BufferPool::with_capacity(2);
        let mut buf = pool.acquire();
        buf.truncate(10);
        pool.release(buf);
        assert_eq!(pool.acquire().len(), BUFFER_SIZE);
    }

    #[test]
    fn test_release_clears_contents() {
        let pool = BufferPool::with_capacity(2);
        let mut buf = pool.acquire();
        buf[0] = 0xFF;
        pool.release(buf);
        // Pool has one idle buffer; the dirty one is the only candidate.
        while pool.available() > 1 {
            let _ = pool.acquire();
        }
        let buf = pool.acquire();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(BufferPool::with_capacity(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let buf = pool.acquire();
                    pool.release(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 64);
    }
}
