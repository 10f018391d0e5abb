//! Fixed-size buffer recycling for the receive path.
//!
//! Every datagram is read into a pooled buffer that travels with the packet
//! through the reorder queue and is returned to the free list once the
//! depacketizer has consumed the payload. Checkout never blocks; the free
//! list is capped so a burst of churn cannot grow memory without bound.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Shared recycler of fixed-capacity receive buffers.
///
/// Clones share the same free list. Checkout and release are safe to call
/// concurrently from different stages.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
    checked_out: AtomicUsize,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `capacity`-byte buffers keeping at most `max_free`
    /// recycled ones.
    pub fn new(capacity: usize, max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                max_free,
                free: Mutex::new(Vec::with_capacity(max_free)),
                checked_out: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// Check a buffer out of the pool, reusing a free one when available.
    ///
    /// Never blocks. The returned buffer has length equal to the pool
    /// capacity; recycled buffers carry stale contents.
    pub fn checkout(&self) -> PooledBuffer {
        let recycled = self.inner.free.lock().unwrap().pop();

        let mut data = match recycled {
            Some(data) => {
                self.inner.recycled.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.capacity)
            }
        };
        if data.len() != self.inner.capacity {
            data.resize(self.inner.capacity, 0);
        }

        self.inner.checked_out.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.checked_out.load(Ordering::Relaxed)
    }

    /// Number of buffers sitting on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Total buffers ever allocated (as opposed to recycled).
    pub fn total_allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn give_back(&self, data: BytesMut) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);

        // undersized buffers (shrunk by a holder) are not worth keeping
        if data.capacity() < self.capacity {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_free {
            free.push(data);
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Exclusively owned by whichever stage currently holds it; dropping it
/// returns the underlying storage to the pool's free list, so a buffer can
/// neither be released twice nor read after release.
pub struct PooledBuffer {
    data: BytesMut,
    pool: Weak<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // pool may already be gone during teardown
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(data);
        }
    }
}
