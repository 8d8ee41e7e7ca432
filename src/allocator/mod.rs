//! Process-wide segment allocator with pooling and memory accounting
//!
//! [`AccountingAllocator`] hands out [`Segment`]s to zones. It keeps a
//! bucketed free list of returned segments so that short-lived zones reuse
//! blocks instead of hammering the system allocator, tracks live and peak
//! memory, and sheds retained memory when an external memory-pressure
//! signal is raised.
//!
//! The bucket array sits behind one coarse [`parking_lot::Mutex`]; pool
//! operations are O(1) list edits, so finer-grained locking buys nothing.
//! The statistics counters are relaxed atomics: they are telemetry, never
//! synchronization, and carry no ordering guarantee with respect to the
//! segment memory itself.

mod pool;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use self::pool::SegmentPool;
use crate::segment::Segment;

pub use self::pool::{
    MAX_SEGMENT_SIZE_POWER, MAX_SEGMENTS_PER_BUCKET, MIN_SEGMENT_SIZE_POWER, NUM_BUCKETS,
};

/// External memory-pressure signal, typically driven by a host-level
/// low-memory notification.
///
/// Anything above `None` makes the allocator free returned segments to the
/// system instead of pooling them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryPressure {
    /// No pressure; returned segments are pooled for reuse.
    None = 0,
    /// Moderate pressure; stop retaining returned segments.
    Moderate = 1,
    /// Critical pressure; stop retaining and drop everything already
    /// retained.
    Critical = 2,
}

impl MemoryPressure {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Moderate,
            _ => Self::Critical,
        }
    }
}

/// Point-in-time snapshot of the allocator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes currently allocated from the system (live and pooled).
    pub current_memory_usage: usize,
    /// High-water mark of `current_memory_usage`; never decreases.
    pub max_memory_usage: usize,
    /// Bytes currently retained in the pool.
    pub current_pool_size: usize,
    /// Fresh system allocations performed so far; unchanged by pool hits.
    pub system_segment_allocations: usize,
}

/// Shared-scope allocator of [`Segment`]s: draws from the bucketed pool or
/// falls back to the system allocator, with global accounting.
///
/// Safe to share across threads (typically via `Arc`); individual zones
/// built on top of it are not.
pub struct AccountingAllocator {
    pool: Mutex<SegmentPool>,
    memory_pressure: AtomicU8,
    current_memory_usage: AtomicUsize,
    max_memory_usage: AtomicUsize,
    current_pool_size: AtomicUsize,
    system_segment_allocations: AtomicUsize,
}

impl AccountingAllocator {
    /// Creates an allocator with an empty pool and no memory pressure.
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(SegmentPool::new()),
            memory_pressure: AtomicU8::new(MemoryPressure::None as u8),
            current_memory_usage: AtomicUsize::new(0),
            max_memory_usage: AtomicUsize::new(0),
            current_pool_size: AtomicUsize::new(0),
            system_segment_allocations: AtomicUsize::new(0),
        }
    }

    /// Gets a segment of at least `bytes` total size, reusing a pooled one
    /// when possible.
    ///
    /// Poolable requests are rounded up to their bucket's power-of-two
    /// size, so a later return lands the segment back in the same bucket;
    /// oversized requests are allocated at exactly `bytes` and never touch
    /// the pool. Returns `None` only when the system allocator fails.
    pub fn get_segment(&self, bytes: usize) -> Option<Box<Segment>> {
        if let Some((bucket, rounded)) = pool::request_bucket(bytes) {
            if let Some(segment) = self.get_segment_from_pool(bucket) {
                debug_assert!(segment.size() >= bytes);
                return Some(segment);
            }
            return self.allocate_segment(rounded);
        }
        self.allocate_segment(bytes)
    }

    /// Takes back a segment released by a zone.
    ///
    /// The payload is wiped first. Under memory pressure the segment goes
    /// straight back to the system; otherwise it is pooled unless its size
    /// class is full or unpoolable.
    pub fn return_segment(&self, mut segment: Box<Segment>) {
        debug_assert!(!segment.has_next());
        segment.zap_contents();

        if self.memory_pressure() != MemoryPressure::None {
            self.free_segment(segment);
            return;
        }

        if let Err(segment) = self.add_segment_to_pool(segment) {
            self.free_segment(segment);
        }
    }

    /// Frees every pooled segment back to the system. Also runs on drop.
    pub fn clear_pool(&self) {
        let drained = self.pool.lock().drain();
        if drained.is_empty() {
            return;
        }
        debug!(segments = drained.len(), "clearing segment pool");
        for segment in drained {
            self.current_pool_size
                .fetch_sub(segment.size(), Ordering::Relaxed);
            self.free_segment(segment);
        }
    }

    /// Updates the pressure level. Raising it to [`MemoryPressure::Critical`]
    /// also drops everything the pool has retained.
    pub fn set_memory_pressure(&self, level: MemoryPressure) {
        let previous = self.memory_pressure.swap(level as u8, Ordering::Relaxed);
        if previous != level as u8 {
            debug!(?level, "memory pressure changed");
        }
        if level == MemoryPressure::Critical {
            self.clear_pool();
        }
    }

    /// Current pressure level.
    pub fn memory_pressure(&self) -> MemoryPressure {
        MemoryPressure::from_raw(self.memory_pressure.load(Ordering::Relaxed))
    }

    /// Bytes currently allocated from the system, pooled segments included.
    pub fn current_memory_usage(&self) -> usize {
        self.current_memory_usage.load(Ordering::Relaxed)
    }

    /// High-water mark of system memory usage.
    pub fn max_memory_usage(&self) -> usize {
        self.max_memory_usage.load(Ordering::Relaxed)
    }

    /// Bytes currently retained in the pool.
    pub fn current_pool_size(&self) -> usize {
        self.current_pool_size.load(Ordering::Relaxed)
    }

    /// Count of fresh system allocations; a pool hit leaves it unchanged.
    pub fn system_segment_allocations(&self) -> usize {
        self.system_segment_allocations.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters.
    ///
    /// The fields are read individually with relaxed loads, so the snapshot
    /// is not atomic across fields.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            current_memory_usage: self.current_memory_usage(),
            max_memory_usage: self.max_memory_usage(),
            current_pool_size: self.current_pool_size(),
            system_segment_allocations: self.system_segment_allocations(),
        }
    }

    fn get_segment_from_pool(&self, bucket: usize) -> Option<Box<Segment>> {
        let segment = self.pool.lock().pop(bucket)?;
        self.current_pool_size
            .fetch_sub(segment.size(), Ordering::Relaxed);
        trace!(size = segment.size(), "segment reused from pool");
        Some(segment)
    }

    fn allocate_segment(&self, bytes: usize) -> Option<Box<Segment>> {
        let segment = Segment::allocate(bytes)?;

        let current = self
            .current_memory_usage
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        let mut max = self.max_memory_usage.load(Ordering::Relaxed);
        while current > max {
            match self.max_memory_usage.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }

        self.system_segment_allocations
            .fetch_add(1, Ordering::Relaxed);
        trace!(size = bytes, "segment allocated from the system");
        Some(segment)
    }

    /// Attempts pool insertion; gives the segment back on rejection so the
    /// caller can free it. Ownership resting with the pool *is* success;
    /// the segment must not also be freed.
    fn add_segment_to_pool(&self, segment: Box<Segment>) -> Result<(), Box<Segment>> {
        let size = segment.size();
        let Some(bucket) = pool::segment_bucket(size) else {
            return Err(segment);
        };

        self.pool.lock().push(bucket, segment)?;
        self.current_pool_size.fetch_add(size, Ordering::Relaxed);
        trace!(size, "segment pooled");
        Ok(())
    }

    fn free_segment(&self, segment: Box<Segment>) {
        self.current_memory_usage
            .fetch_sub(segment.size(), Ordering::Relaxed);
        trace!(size = segment.size(), "segment freed to the system");
        drop(segment);
    }

    #[cfg(test)]
    fn bucket_len(&self, bucket: usize) -> usize {
        self.pool.lock().bucket_len(bucket)
    }
}

impl Default for AccountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AccountingAllocator {
    fn drop(&mut self) {
        self.clear_pool();
    }
}

impl std::fmt::Debug for AccountingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountingAllocator")
            .field("stats", &self.stats())
            .field("memory_pressure", &self.memory_pressure())
            .finish()
    }
}
