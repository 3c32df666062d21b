//! Pools: the concurrent allocate/free protocol for one size class on one node
//!
//! Implements a two-level free list:
//! - a pool-wide lock-free queue of ready blocks serves the fast path
//! - per-segment deferred lists absorb frees without touching the pool
//! - the pool mutex serializes collection, growth and segment release
//!
//! Segments are allocated from the NUMA provider, registered with the
//! transport and, for device pools, mirrored on the device.

use crate::device::DeviceExtent;
use crate::error::{HeapError, HeapResult};
use crate::memory::block::Block;
use crate::memory::segment::{DeviceSegment, Segment};
use crate::memory::stats::{HeapStats, PoolStats};
use crate::memory::HeapContext;
use crate::numa::NumaExtent;
use crate::register::{RegistrationFlags, Registrar};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

type SegmentMap<R> = HashMap<usize, Box<Segment<R>>>;

/// Blocks of one size on one NUMA node (and optionally one device)
///
/// Segments keep a back-pointer to their pool, so a pool must not move once
/// it has allocated. Pools live in boxed slices owned by a fixed-size heap.
pub(crate) struct Pool<R: Registrar> {
    // Dropped before the segments its blocks point into.
    free_list: SegQueue<Block<R>>,
    segments: Mutex<SegmentMap<R>>,
    context: Arc<HeapContext<R>>,
    block_size: usize,
    segment_size: usize,
    node: usize,
    device: Option<usize>,
    stats: PoolStats,
}

impl<R: Registrar> Pool<R> {
    pub(crate) fn new(
        context: Arc<HeapContext<R>>,
        block_size: usize,
        segment_size: usize,
        node: usize,
        device: Option<usize>,
    ) -> Self {
        Self {
            free_list: SegQueue::new(),
            segments: Mutex::new(HashMap::new()),
            context,
            block_size,
            segment_size,
            node,
            device,
            stats: PoolStats::default(),
        }
    }

    /// Take a free block, growing the pool if needed
    ///
    /// # Errors
    ///
    /// Returns error if a new segment cannot be allocated or registered.
    pub(crate) fn allocate(&self) -> HeapResult<Block<R>> {
        if let Some(block) = self.free_list.pop() {
            return Ok(block);
        }
        self.allocate_slow()
    }

    #[cold]
    fn allocate_slow(&self) -> HeapResult<Block<R>> {
        let mut segments = self.segments.lock();
        self.stats.record_slow_path();

        // Another thread may have grown or collected while we waited.
        if let Some(block) = self.free_list.pop() {
            return Ok(block);
        }

        let collected: usize = segments
            .values()
            .map(|segment| segment.collect(&self.free_list))
            .sum();
        self.stats.record_collection(collected);
        if let Some(block) = self.free_list.pop() {
            return Ok(block);
        }

        // Fast-path callers can drain a fresh segment before we pop from it.
        // Grow on even rounds and give the queue a chance on odd ones.
        let mut round = 0usize;
        loop {
            if round % 2 == 0 {
                self.add_segment(&mut segments)?;
            } else {
                std::hint::spin_loop();
            }
            round += 1;
            if let Some(block) = self.free_list.pop() {
                return Ok(block);
            }
        }
    }

    fn add_segment(&self, segments: &mut SegmentMap<R>) -> HeapResult<()> {
        let extent = NumaExtent::allocate(
            Arc::clone(&self.context.numa),
            self.segment_size,
            self.node,
        )?;
        if extent.node() != self.node {
            return Err(HeapError::WrongNode {
                requested: self.node,
                actual: extent.node(),
            });
        }

        let len = extent.allocation().size;
        if len < self.block_size {
            return Err(HeapError::InvalidSize {
                size: self.block_size,
            });
        }

        let registrar = &self.context.registrar;
        let region = registrar.register(extent.ptr(), len, RegistrationFlags::NONE)?;
        let device = match self.device {
            Some(device) => {
                let provider = self
                    .context
                    .device
                    .as_ref()
                    .ok_or(HeapError::DeviceSupportDisabled)?;
                let extent = DeviceExtent::allocate(Arc::clone(provider), len, device)?;
                let region =
                    registrar.register_device(extent.ptr(), len, device, RegistrationFlags::NONE)?;
                Some(DeviceSegment { region, extent })
            }
            None => None,
        };

        let segment = Segment::new(NonNull::from(self), extent, region, device, self.block_size);
        segment.populate(&self.free_list);
        tracing::debug!(
            block_size = self.block_size,
            capacity = segment.capacity(),
            node = segment.node(),
            device = ?self.device,
            segments = segments.len() + 1,
            "added segment"
        );
        segments.insert(segment.key(), segment);
        self.stats.record_segment_created();
        Ok(())
    }

    /// Return `block` to `segment`, releasing the segment once it is empty
    pub(crate) fn free(&self, segment: NonNull<Segment<R>>, block: Block<R>) {
        let key = segment.as_ptr() as usize;
        // SAFETY: a segment stays in the map while any of its blocks is outstanding.
        let emptied = unsafe { segment.as_ref() }.free(block);
        if !emptied || self.context.never_free {
            return;
        }

        let mut segments = self.segments.lock();
        if segments.len() <= self.context.num_reserve_segments {
            return;
        }
        // Look the segment up again: it may have been collected and handed out,
        // or already released, since the unlocked free above.
        if !segments.get(&key).is_some_and(|segment| segment.is_empty()) {
            return;
        }
        if let Some(segment) = segments.remove(&key) {
            tracing::debug!(
                block_size = self.block_size,
                node = self.node,
                segments = segments.len(),
                "releasing empty segment"
            );
            drop(segment);
            self.stats.record_segment_released();
        }
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segments.lock().len()
    }

    pub(crate) fn stats(&self) -> HeapStats {
        self.stats.snapshot(self.num_segments())
    }

    #[cfg(test)]
    pub(crate) const fn block_size(&self) -> usize {
        self.block_size
    }

    #[cfg(test)]
    pub(crate) const fn device(&self) -> Option<usize> {
        self.device
    }
}

impl<R: Registrar> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.block_size)
            .field("segment_size", &self.segment_size)
            .field("node", &self.node)
            .field("device", &self.device)
            .field("free_blocks", &self.free_list.len())
            .finish_non_exhaustive()
    }
}
