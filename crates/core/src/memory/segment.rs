//! Segments: registered extents sliced into equal blocks
//!
//! Blocks returned to a segment go onto its own bounded deferred list. The
//! owning pool drains that list in bulk under its mutex, so frees from any
//! number of threads never contend on the pool-wide free list.

use crate::device::DeviceExtent;
use crate::memory::block::{Block, DeviceMirror};
use crate::memory::pool::Pool;
use crate::numa::NumaExtent;
use crate::register::{Region, Registrar};
use crossbeam::queue::{ArrayQueue, SegQueue};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

/// Device copy of a segment
pub(crate) struct DeviceSegment<R: Registrar> {
    pub(crate) region: R::Region,
    pub(crate) extent: DeviceExtent,
}

pub(crate) struct Segment<R: Registrar> {
    // Field order is drop order: blocks, then registrations, then memory.
    deferred: ArrayQueue<Block<R>>,
    region: R::Region,
    device: Option<DeviceSegment<R>>,
    extent: NumaExtent,
    pool: NonNull<Pool<R>>,
    block_size: usize,
    capacity: usize,
    /// Blocks pushed onto `deferred` and not yet collected.
    /// Signed: a collect may subtract before a racing free adds.
    num_freed: AtomicIsize,
}

// SAFETY: the pool back-pointer is only dereferenced while the pool is alive
// (it owns the segment); every other field is Send + Sync.
unsafe impl<R: Registrar> Send for Segment<R> {}
unsafe impl<R: Registrar> Sync for Segment<R> {}

impl<R: Registrar> Segment<R> {
    /// Build a segment over `extent`
    ///
    /// The segment is boxed so block back-pointers stay valid; call
    /// [`Segment::populate`] once to hand its blocks to the pool.
    pub(crate) fn new(
        pool: NonNull<Pool<R>>,
        extent: NumaExtent,
        region: R::Region,
        device: Option<DeviceSegment<R>>,
        block_size: usize,
    ) -> Box<Self> {
        let capacity = extent.allocation().size / block_size;
        Box::new(Self {
            deferred: ArrayQueue::new(capacity.max(1)),
            region,
            device,
            extent,
            pool,
            block_size,
            capacity,
            num_freed: AtomicIsize::new(0),
        })
    }

    /// Push every block onto `free_list`, lowest address first
    pub(crate) fn populate(&self, free_list: &SegQueue<Block<R>>) {
        let this = NonNull::from(self);
        let base = self.extent.ptr();
        for index in 0..self.capacity {
            let offset = index * self.block_size;
            // SAFETY: offset + block_size <= extent size.
            let ptr = unsafe { base.add(offset) };
            free_list.push(self.make_block(this, ptr, offset));
        }
    }

    fn make_block(&self, this: NonNull<Self>, ptr: NonNull<u8>, offset: usize) -> Block<R> {
        let device = self.device.as_ref().map(|device| DeviceMirror {
            // SAFETY: the device extent has the same size as the host extent.
            ptr: unsafe { device.extent.ptr().add(offset) },
            handle: device.region.handle(offset, self.block_size),
        });
        Block::from_segment(
            this,
            ptr,
            self.block_size,
            self.region.handle(offset, self.block_size),
            device,
        )
    }

    /// Rebuild the block starting at `address`
    pub(crate) fn block_at(&self, this: NonNull<Self>, address: NonNull<u8>) -> Block<R> {
        let offset = address.as_ptr() as usize - self.extent.ptr().as_ptr() as usize;
        self.make_block(this, address, offset)
    }

    /// Pool that owns the segment
    ///
    /// # Safety
    ///
    /// `segment` must point to a live segment.
    pub(crate) unsafe fn pool_of<'a>(segment: NonNull<Self>) -> &'a Pool<R> {
        // SAFETY: the pool owns the segment and outlives it.
        unsafe { segment.as_ref().pool.as_ref() }
    }

    /// Return `block` to the deferred list
    ///
    /// Returns `true` iff this free made every block of the segment free.
    pub(crate) fn free(&self, block: Block<R>) -> bool {
        if let Err(block) = self.deferred.push(block) {
            tracing::error!(
                address = ?block.ptr(),
                "deferred free list overflow, block freed twice"
            );
            return false;
        }
        let freed = self.num_freed.fetch_add(1, Ordering::AcqRel) + 1;
        usize::try_from(freed).is_ok_and(|freed| freed == self.capacity)
    }

    /// Move every deferred block onto `free_list`
    ///
    /// Callers hold the pool mutex.
    pub(crate) fn collect(&self, free_list: &SegQueue<Block<R>>) -> usize {
        let mut drained = 0usize;
        while let Some(block) = self.deferred.pop() {
            free_list.push(block);
            drained += 1;
        }
        if drained > 0 {
            self.num_freed
                .fetch_sub(isize::try_from(drained).unwrap_or(isize::MAX), Ordering::AcqRel);
        }
        drained
    }

    /// Every block of the segment sits in the deferred list
    pub(crate) fn is_empty(&self) -> bool {
        usize::try_from(self.num_freed.load(Ordering::Acquire))
            .is_ok_and(|freed| freed == self.capacity)
    }

    /// Identity of the segment within its pool
    pub(crate) fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) const fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn node(&self) -> usize {
        self.extent.node()
    }
}

impl<R: Registrar> fmt::Debug for Segment<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.extent.ptr())
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("num_freed", &self.num_freed.load(Ordering::Relaxed))
            .field("device", &self.device.is_some())
            .finish_non_exhaustive()
    }
}
