//! Buffer pool for zero-allocation frame assembly.
//!
//! Frame payloads are copied into fixed-capacity buffers drawn from a shared
//! pool: the receive path fills one per inbound data frame, the send path one
//! per outbound chunk. [`PooledBuf`] returns its storage to the pool on drop,
//! so buffers recycle naturally as frames are serialized or consumed.
//!
//! The free list is bounded; beyond `max_idle` buffers are simply freed.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default number of idle buffers retained by [`BufferPool::default`].
pub const DEFAULT_MAX_IDLE: usize = 64;

/// A shared pool of fixed-capacity byte buffers.
///
/// Cheaply cloneable; clones share the same free list.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers with the given capacity, retaining
    /// at most `max_idle` idle buffers.
    pub fn new(buf_capacity: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buf_capacity,
                max_idle,
            }),
        }
    }

    /// Acquire an empty buffer, recycling an idle one when available.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buf_capacity));
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// Capacity of buffers handed out by this pool.
    pub fn buf_capacity(&self) -> usize {
        self.inner.buf_capacity
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.inner.free.lock().expect("buffer pool lock poisoned").len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.inner.free.lock().expect("buffer pool lock poisoned");
        if free.len() < self.inner.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(crate::protocol::MAX_DATA_LEN, DEFAULT_MAX_IDLE)
    }
}

/// A buffer leased from a [`BufferPool`]; returns to the pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_recycles() {
        let pool = BufferPool::new(128, 8);
        assert_eq!(pool.idle_count(), 0);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"data");
        assert_eq!(&buf[..], b"data");
        drop(buf);

        assert_eq!(pool.idle_count(), 1);
        // Recycled buffer comes back empty.
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_max_idle_bound() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(bufs);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_clones_share_free_list() {
        let pool = BufferPool::new(16, 8);
        let clone = pool.clone();
        drop(clone.acquire());
        assert_eq!(pool.idle_count(), 1);
    }
}
