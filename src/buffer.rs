//! Buffer provider: recycled large buffers for oversize messages
//!
//! Three tiers back every connection:
//!
//! 1. a per-connection static buffer, owned by the reader and fixed at
//!    construction;
//! 2. a server-wide pool of preallocated large buffers, taken under a mutex
//!    when a message outgrows the static buffer;
//! 3. a heap fallback when the pool is dry or the message exceeds the pooled
//!    size but still fits under `max_message_size`.
//!
//! A [`BorrowedBuffer`] records which tier it came from and returns itself on
//! drop, so a borrow is released on exactly one of message-complete,
//! message-abort, or connection-teardown.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Shared provider of large message buffers.
///
/// Cloning is cheap and clones share the same free list; the blocking worker
/// hands one provider to every connection thread, and clients may share one
/// across sessions.
#[derive(Clone)]
pub struct BufferProvider {
    pool: Arc<Mutex<Vec<Box<[u8]>>>>,
    pooled_size: usize,
    max_message_size: usize,
}

impl BufferProvider {
    /// Preallocate `count` buffers of `pooled_size` bytes.
    pub fn new(count: usize, pooled_size: usize, max_message_size: usize) -> Self {
        let pool = (0..count)
            .map(|_| vec![0u8; pooled_size].into_boxed_slice())
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            pooled_size,
            max_message_size,
        }
    }

    /// Allocate a static buffer for a connection reader.
    pub fn static_buffer(size: usize) -> Box<[u8]> {
        vec![0u8; size].into_boxed_slice()
    }

    /// Borrow a buffer of at least `size` bytes.
    ///
    /// Pops from the pool when `size` fits the pooled buffers and one is
    /// free; falls back to a heap allocation up to `max_message_size`.
    pub fn acquire(&self, size: usize) -> Result<BorrowedBuffer> {
        if size > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        if size <= self.pooled_size {
            if let Some(buf) = self.pool.lock().pop() {
                return Ok(BorrowedBuffer {
                    buf: Some(buf),
                    pool: Some(Arc::clone(&self.pool)),
                });
            }
        }

        Ok(BorrowedBuffer {
            buf: Some(vec![0u8; size].into_boxed_slice()),
            pool: None,
        })
    }

    /// Grow a borrowed buffer to hold at least `needed` bytes, preserving the
    /// first `used` bytes. No-op when the buffer is already large enough.
    pub fn grow(&self, buf: &mut BorrowedBuffer, used: usize, needed: usize) -> Result<()> {
        if needed <= buf.capacity() {
            return Ok(());
        }
        let mut bigger = self.acquire(needed)?;
        bigger.as_mut_slice()[..used].copy_from_slice(&buf.as_slice()[..used]);
        std::mem::swap(buf, &mut bigger);
        Ok(())
    }

    /// Number of free pooled buffers.
    pub fn free_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Configured size of each pooled buffer.
    pub fn pooled_size(&self) -> usize {
        self.pooled_size
    }

    /// Configured maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

/// A large buffer on loan from a [`BufferProvider`].
///
/// Pool-owned buffers return to the free list on drop; heap-owned buffers are
/// freed.
pub struct BorrowedBuffer {
    buf: Option<Box<[u8]>>,
    pool: Option<Arc<Mutex<Vec<Box<[u8]>>>>>,
}

impl BorrowedBuffer {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// True when this borrow came from the shared pool.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for BorrowedBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.take()) {
            pool.lock().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_buffer_returns_on_drop() {
        let provider = BufferProvider::new(2, 1024, 65536);
        assert_eq!(provider.free_count(), 2);

        let a = provider.acquire(512).unwrap();
        assert!(a.is_pooled());
        assert_eq!(a.capacity(), 1024);
        assert_eq!(provider.free_count(), 1);

        drop(a);
        assert_eq!(provider.free_count(), 2);
    }

    #[test]
    fn heap_fallback_when_pool_dry() {
        let provider = BufferProvider::new(1, 1024, 65536);
        let a = provider.acquire(100).unwrap();
        let b = provider.acquire(100).unwrap();
        assert!(a.is_pooled());
        assert!(!b.is_pooled());
        assert_eq!(b.capacity(), 100);

        drop(b);
        assert_eq!(provider.free_count(), 0);
        drop(a);
        assert_eq!(provider.free_count(), 1);
    }

    #[test]
    fn heap_fallback_for_oversize_requests() {
        let provider = BufferProvider::new(4, 1024, 65536);
        let b = provider.acquire(4096).unwrap();
        assert!(!b.is_pooled());
        assert_eq!(provider.free_count(), 4);
    }

    #[test]
    fn rejects_over_max() {
        let provider = BufferProvider::new(1, 1024, 4096);
        assert!(matches!(
            provider.acquire(4097),
            Err(Error::MessageTooLarge)
        ));
        assert!(provider.acquire(4096).is_ok());
    }

    #[test]
    fn grow_preserves_prefix() {
        let provider = BufferProvider::new(1, 64, 65536);
        let mut b = provider.acquire(32).unwrap();
        b.as_mut_slice()[..4].copy_from_slice(b"abcd");

        provider.grow(&mut b, 4, 1000).unwrap();
        assert!(b.capacity() >= 1000);
        assert_eq!(&b.as_slice()[..4], b"abcd");

        // The original pooled buffer went back to the free list on swap.
        assert_eq!(provider.free_count(), 1);
    }

    #[test]
    fn shared_clones_use_one_free_list() {
        let provider = BufferProvider::new(1, 1024, 65536);
        let clone = provider.clone();
        let a = clone.acquire(10).unwrap();
        assert_eq!(provider.free_count(), 0);
        drop(a);
        assert_eq!(provider.free_count(), 1);
    }
}
