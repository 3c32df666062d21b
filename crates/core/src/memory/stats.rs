//! Pool and heap statistics
//!
//! Counters are relaxed atomics updated on the slow path only; the lock-free
//! fast path never touches them.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one pool
#[derive(Debug, Default)]
pub struct PoolStats {
    segments_created: AtomicU64,
    segments_released: AtomicU64,
    collections: AtomicU64,
    blocks_collected: AtomicU64,
    slow_path_allocations: AtomicU64,
}

impl PoolStats {
    /// Record a new segment
    pub fn record_segment_created(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a released segment
    pub fn record_segment_released(&self) {
        self.segments_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one collection pass that reclaimed `blocks` blocks
    pub fn record_collection(&self, blocks: usize) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.blocks_collected
            .fetch_add(u64::try_from(blocks).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Record an allocation that missed the fast path
    pub fn record_slow_path(&self) {
        self.slow_path_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters; `live_segments` is supplied by the pool
    #[must_use]
    pub fn snapshot(&self, live_segments: usize) -> HeapStats {
        HeapStats {
            pools: 1,
            live_segments: u64::try_from(live_segments).unwrap_or(u64::MAX),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            segments_released: self.segments_released.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            blocks_collected: self.blocks_collected.load(Ordering::Relaxed),
            slow_path_allocations: self.slow_path_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Aggregated statistics over one or more pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    /// Pools included in the aggregate
    pub pools: u64,
    /// Segments currently owned
    pub live_segments: u64,
    /// Segments ever created
    pub segments_created: u64,
    /// Segments released back to the backing store
    pub segments_released: u64,
    /// Collection passes run on the slow path
    pub collections: u64,
    /// Blocks moved from deferred lists back to pool free lists
    pub blocks_collected: u64,
    /// Allocations that took the pool mutex
    pub slow_path_allocations: u64,
}

impl AddAssign for HeapStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pools += rhs.pools;
        self.live_segments += rhs.live_segments;
        self.segments_created += rhs.segments_created;
        self.segments_released += rhs.segments_released;
        self.collections += rhs.collections;
        self.blocks_collected += rhs.blocks_collected;
        self.slow_path_allocations += rhs.slow_path_allocations;
    }
}

impl std::iter::Sum for HeapStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, stats| {
            acc += stats;
            acc
        })
    }
}
