//! Process-wide pool of power-of-two-sized byte buffers.
//!
//! Trial decryption and datagram relaying are hot paths that would otherwise
//! allocate a fresh `Vec<u8>` per packet. Buffers are bucketed by their
//! rounded-up-to-power-of-two capacity; a checkout that misses its bucket
//! just allocates (the pool never blocks). Buffers above `MAX_POOLED` are
//! never pooled — they are rare (oversized UDP payloads) and pooling them
//! would let one large connection inflate memory held by everyone else.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

const MIN_BUCKET_SHIFT: u32 = 9; // 512 B
const MAX_BUCKET_SHIFT: u32 = 17; // 128 KiB
const MAX_POOLED: usize = 1 << MAX_BUCKET_SHIFT;
const NUM_BUCKETS: usize = (MAX_BUCKET_SHIFT - MIN_BUCKET_SHIFT + 1) as usize;
const PER_BUCKET_CAP: usize = 256;

fn bucket_for(len: usize) -> Option<(usize, usize)> {
    if len == 0 || len > MAX_POOLED {
        return None;
    }
    let shift = (usize::BITS - (len - 1).leading_zeros()).max(MIN_BUCKET_SHIFT);
    if shift > MAX_BUCKET_SHIFT {
        return None;
    }
    let idx = (shift - MIN_BUCKET_SHIFT) as usize;
    Some((idx, 1usize << shift))
}

/// A buffer checked out from the pool. Returned to its bucket on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    bucket: Option<usize>,
}

impl PooledBuf {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    #[inline]
    pub fn resize(&mut self, len: usize, val: u8) {
        self.buf.resize(len, val);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.bucket = None;
        std::mem::take(&mut self.buf)
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(idx) = self.bucket {
            BUFFER_POOL.release(idx, std::mem::take(&mut self.buf));
        }
    }
}

struct Bucket {
    free: Mutex<VecDeque<Vec<u8>>>,
}

/// Process-wide buffer pool, thread-safe, bucketed by power-of-two capacity.
pub struct BufferPool {
    buckets: Vec<Bucket>,
    hits: AtomicU64,
    misses: AtomicU64,
    unpooled: AtomicU64,
}

impl BufferPool {
    fn new() -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| Bucket {
                free: Mutex::new(VecDeque::new()),
            })
            .collect();
        BufferPool {
            buckets,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            unpooled: AtomicU64::new(0),
        }
    }

    /// Check out a buffer with at least `len` bytes, zero-filled up to `len`.
    pub fn acquire(&self, len: usize) -> PooledBuf {
        match bucket_for(len) {
            Some((idx, cap)) => {
                let mut buf = {
                    let mut free = self.buckets[idx].free.lock();
                    free.pop_front()
                };
                match &mut buf {
                    Some(v) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        v.clear();
                        v.resize(len, 0);
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        buf = Some(vec![0u8; cap.max(len)]);
                        buf.as_mut().unwrap().truncate(len);
                    }
                }
                PooledBuf {
                    buf: buf.unwrap(),
                    bucket: Some(idx),
                }
            }
            None => {
                self.unpooled.fetch_add(1, Ordering::Relaxed);
                PooledBuf {
                    buf: vec![0u8; len],
                    bucket: None,
                }
            }
        }
    }

    fn release(&self, idx: usize, mut buf: Vec<u8>) {
        let mut free = self.buckets[idx].free.lock();
        if free.len() < PER_BUCKET_CAP {
            buf.clear();
            free.push_back(buf);
        }
        // else: drop it, this bucket has enough spares already
    }

    /// Checkout/miss/unpooled counters, for diagnostics.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.unpooled.load(Ordering::Relaxed),
        )
    }
}

static BUFFER_POOL_INIT: once_cell::sync::Lazy<BufferPool> = once_cell::sync::Lazy::new(BufferPool::new);
static BUFFER_POOL: &once_cell::sync::Lazy<BufferPool> = &BUFFER_POOL_INIT;

/// Check out a pooled buffer of at least `len` bytes from the process-wide pool.
pub fn acquire(len: usize) -> PooledBuf {
    BUFFER_POOL.acquire(len)
}

/// Snapshot of the process-wide pool's hit/miss/unpooled counters.
pub fn stats() -> (u64, u64, u64) {
    BUFFER_POOL.stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_exact_len() {
        let buf = acquire(1500);
        assert_eq!(buf.len(), 1500);
    }

    #[test]
    fn test_bucket_rounding() {
        assert_eq!(bucket_for(1).unwrap().1, 1 << MIN_BUCKET_SHIFT);
        assert_eq!(bucket_for(513).unwrap().1, 1024);
        assert_eq!(bucket_for(1024).unwrap().1, 1024);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let buf = acquire(MAX_POOLED + 1);
        assert_eq!(buf.len(), MAX_POOLED + 1);
    }

    #[test]
    fn test_reuse_after_drop() {
        let (_, misses_before, _) = stats();
        {
            let _b = acquire(4096);
        }
        let _b2 = acquire(4096);
        let (hits_after, misses_after, _) = stats();
        assert!(hits_after >= 1 || misses_after > misses_before);
    }
}
