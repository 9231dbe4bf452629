//! Process-wide pooled byte-array allocator (C1).
//!
//! Buffers are bucketed into size classes from 128 bytes up to ~1 MiB,
//! doubling each step. Each bucket keeps a bounded, per-thread LIFO free
//! list over a bounded global stack so the common case (rent/return on the
//! same thread) never touches shared state.
//!
//! Oversized requests (bigger than the largest bucket) bypass the pool
//! entirely and are freed normally on drop.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

/// Smallest bucket size class, in bytes.
pub const MIN_BUCKET_SIZE: usize = 128;
/// Largest bucket size class, in bytes. Requests above this bypass the pool.
pub const MAX_BUCKET_SIZE: usize = 1 << 20;
/// Bound on the per-thread free list and the global stack, per bucket.
const DEFAULT_BUCKET_CAPACITY: usize = 256;

fn bucket_sizes() -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = MIN_BUCKET_SIZE;
    while size <= MAX_BUCKET_SIZE {
        sizes.push(size);
        size *= 2;
    }
    sizes
}

fn bucket_index_for(len: usize) -> Option<usize> {
    if len > MAX_BUCKET_SIZE {
        return None;
    }
    let mut size = MIN_BUCKET_SIZE;
    let mut idx = 0;
    while size < len {
        size *= 2;
        idx += 1;
    }
    Some(idx)
}

/// Running counters exposed at shutdown (§4.13 "stats at shutdown").
#[derive(Debug, Default)]
pub struct PoolStats {
    pub rented: AtomicU64,
    pub returned: AtomicU64,
    pub dropped_over_capacity: AtomicU64,
    pub bypassed_oversized: AtomicU64,
}

struct Bucket {
    size: usize,
    global: ArrayQueue<Vec<u8>>,
    last_activity: std::sync::Mutex<Instant>,
}

impl Bucket {
    fn new(size: usize, capacity: usize) -> Self {
        Self {
            size,
            global: ArrayQueue::new(capacity),
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Instant::now();
        }
    }
}

/// Per-bucket warm-up / max-count overrides (§6 `pool.warmUpCounts`,
/// `pool.maxCounts`).
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// `(bucket size, warm-up count)` pairs. Buckets not listed start empty.
    pub warm_up_counts: Vec<(usize, usize)>,
    /// `(bucket size, max count)` pairs overriding `DEFAULT_BUCKET_CAPACITY`.
    pub max_counts: Vec<(usize, usize)>,
    /// How long a bucket may sit idle before the trimmer reduces it back
    /// towards its warm-up count.
    pub idle_window: Duration,
}

impl PoolConfig {
    pub fn idle_window_default() -> Duration {
        Duration::from_secs(300)
    }
}

/// The process-wide pool. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buckets: Vec<Bucket>,
    warm_up_counts: Vec<usize>,
    idle_window: Duration,
    stats: PoolStats,
}

thread_local! {
    static LOCAL_FREE_LISTS: RefCell<Vec<Vec<Vec<u8>>>> = RefCell::new(Vec::new());
}

const LOCAL_FREE_LIST_CAPACITY: usize = 32;

impl BufferPool {
    /// Builds the pool and performs warm-up allocation for every configured
    /// bucket (§4.13 "warm-up at start").
    pub fn new(config: PoolConfig) -> Self {
        let sizes = bucket_sizes();
        let mut warm_up_counts = vec![0usize; sizes.len()];
        for (size, count) in &config.warm_up_counts {
            if let Some(idx) = bucket_index_for(*size) {
                warm_up_counts[idx] = *count;
            }
        }
        let mut max_counts = vec![DEFAULT_BUCKET_CAPACITY; sizes.len()];
        for (size, count) in &config.max_counts {
            if let Some(idx) = bucket_index_for(*size) {
                max_counts[idx] = *count;
            }
        }

        let buckets: Vec<Bucket> = sizes
            .iter()
            .zip(max_counts.iter())
            .map(|(&size, &cap)| Bucket::new(size, cap.max(1)))
            .collect();

        for (idx, bucket) in buckets.iter().enumerate() {
            for _ in 0..warm_up_counts[idx] {
                let _ = bucket.global.push(vec![0u8; bucket.size]);
            }
        }

        let idle_window = if config.idle_window.is_zero() {
            PoolConfig::idle_window_default()
        } else {
            config.idle_window
        };

        BufferPool {
            inner: Arc::new(PoolInner {
                buckets,
                warm_up_counts,
                idle_window,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Rents a buffer of length >= `n` from the smallest fitting bucket.
    /// Oversized requests bypass the pool and allocate directly.
    pub fn rent(&self, n: usize) -> PooledBuffer {
        let Some(idx) = bucket_index_for(n) else {
            self.inner
                .stats
                .bypassed_oversized
                .fetch_add(1, Ordering::Relaxed);
            return PooledBuffer {
                pool: None,
                bucket_idx: usize::MAX,
                data: vec![0u8; n],
                logical_len: n,
            };
        };
        let bucket = &self.inner.buckets[idx];
        self.inner.stats.rented.fetch_add(1, Ordering::Relaxed);

        if let Some(buf) = Self::try_take_local(idx) {
            bucket.touch();
            return PooledBuffer {
                pool: Some(self.clone()),
                bucket_idx: idx,
                data: buf,
                logical_len: n,
            };
        }
        if let Some(buf) = bucket.global.pop() {
            bucket.touch();
            return PooledBuffer {
                pool: Some(self.clone()),
                bucket_idx: idx,
                data: buf,
                logical_len: n,
            };
        }
        bucket.touch();
        PooledBuffer {
            pool: Some(self.clone()),
            bucket_idx: idx,
            data: vec![0u8; bucket.size],
            logical_len: n,
        }
    }

    fn try_take_local(idx: usize) -> Option<Vec<u8>> {
        LOCAL_FREE_LISTS.with(|lists| {
            let mut lists = lists.borrow_mut();
            if lists.len() <= idx {
                return None;
            }
            lists[idx].pop()
        })
    }

    /// Accepts a buffer back into the pool. The buffer's length must match
    /// a bucket size class (i.e. it must have come from `rent`); anything
    /// else is dropped. Over-capacity returns are dropped and counted.
    fn return_buffer(&self, bucket_idx: usize, buf: Vec<u8>) {
        if bucket_idx == usize::MAX || bucket_idx >= self.inner.buckets.len() {
            return; // Was an oversized/bypassed allocation; just drop it.
        }
        let bucket = &self.inner.buckets[bucket_idx];
        if buf.len() != bucket.size {
            self.inner
                .stats
                .dropped_over_capacity
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let overflow = LOCAL_FREE_LISTS.with(|lists| {
            let mut lists = lists.borrow_mut();
            while lists.len() <= bucket_idx {
                lists.push(Vec::new());
            }
            let local = &mut lists[bucket_idx];
            if local.len() < LOCAL_FREE_LIST_CAPACITY {
                local.push(buf);
                None
            } else {
                Some(buf)
            }
        });
        let Some(buf) = overflow else {
            self.inner.stats.returned.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if bucket.global.push(buf).is_ok() {
            self.inner.stats.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .stats
                .dropped_over_capacity
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reduces global stacks back toward their warm-up counts for any
    /// bucket that has seen no rent/return activity within the idle
    /// window. Intended to be called periodically from a maintenance task.
    pub fn trim_idle(&self) {
        let now = Instant::now();
        for (idx, bucket) in self.inner.buckets.iter().enumerate() {
            let idle_for = bucket
                .last_activity
                .lock()
                .map(|guard| now.duration_since(*guard))
                .unwrap_or_default();
            if idle_for < self.inner.idle_window {
                continue;
            }
            let target = self.inner.warm_up_counts[idx];
            while bucket.global.len() > target {
                if bucket.global.pop().is_none() {
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }
}

/// A rented buffer. Returns itself to the pool on drop unless it was
/// already consumed by `into_vec`.
///
/// The backing allocation is always a full bucket size (or the exact
/// oversized request), but callers usually want fewer bytes than that —
/// `truncate` narrows the logical length without shrinking the
/// allocation, so the full buffer still goes back to the right bucket.
pub struct PooledBuffer {
    pool: Option<BufferPool>,
    bucket_idx: usize,
    data: Vec<u8>,
    logical_len: usize,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.logical_len]
    }

    /// Exposes the full backing allocation for writing, including bytes
    /// beyond the current logical length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.logical_len
    }

    pub fn is_empty(&self) -> bool {
        self.logical_len == 0
    }

    /// Narrows the logical length reported by `len`/`as_slice`. `new_len`
    /// must not exceed the backing allocation's size.
    pub fn truncate(&mut self, new_len: usize) {
        assert!(new_len <= self.data.len(), "truncate beyond backing allocation");
        self.logical_len = new_len;
    }

    /// Consumes the buffer without returning it to the pool, truncated to
    /// its logical length. Used when ownership is being handed off to
    /// something outside the pool's bookkeeping (e.g. wrapped in
    /// `bytes::Bytes`).
    pub fn into_vec(mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        data.truncate(self.logical_len);
        data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let data = std::mem::take(&mut self.data);
            if !data.is_empty() || self.bucket_idx != usize::MAX {
                pool.return_buffer(self.bucket_idx, data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_returns_buffer_at_least_requested_size() {
        let pool = BufferPool::new(PoolConfig::default());
        let mut buf = pool.rent(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.as_mut_slice().len() >= 100);
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let pool = BufferPool::new(PoolConfig::default());
        let buf = pool.rent(MAX_BUCKET_SIZE + 1);
        assert_eq!(buf.len(), MAX_BUCKET_SIZE + 1);
        assert_eq!(
            pool.stats().bypassed_oversized.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = BufferPool::new(PoolConfig::default());
        {
            let _buf = pool.rent(200);
        } // Dropped -> returned.
        assert_eq!(pool.stats().returned.load(Ordering::Relaxed), 1);
        let _buf2 = pool.rent(200);
        // Second rent should have been served without growing allocations,
        // we can't observe that directly but rented count should be 2.
        assert_eq!(pool.stats().rented.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn warm_up_preallocates_requested_counts() {
        let pool = BufferPool::new(PoolConfig {
            warm_up_counts: vec![(MIN_BUCKET_SIZE, 4)],
            ..Default::default()
        });
        for _ in 0..4 {
            let buf = pool.rent(MIN_BUCKET_SIZE);
            assert_eq!(buf.len(), MIN_BUCKET_SIZE);
            std::mem::forget(buf); // Don't return, just count they existed.
        }
    }
}
