//! Fixed-size heaps: one block size, one pool per node and node×device pair
//!
//! Frees bypass this level: a block returns straight to the pool of its own
//! segment through its back-pointer.

use crate::error::{HeapError, HeapResult};
use crate::memory::block::Block;
use crate::memory::pool::Pool;
use crate::memory::stats::HeapStats;
use crate::memory::HeapContext;
use crate::register::Registrar;
use std::fmt;
use std::sync::Arc;

pub(crate) struct FixedSizeHeap<R: Registrar> {
    block_size: usize,
    segment_size: usize,
    /// Indexed by node id; `None` for ids that are not host nodes.
    host: Box<[Option<Pool<R>>]>,
    /// Indexed by node id, then device id. Empty without device support.
    devices: Box<[Option<Box<[Pool<R>]>>]>,
}

impl<R: Registrar> FixedSizeHeap<R> {
    pub(crate) fn new(context: &Arc<HeapContext<R>>, block_size: usize, segment_size: usize) -> Self {
        let host_nodes = context.numa.host_nodes();
        let slots = host_nodes.iter().max().map_or(0, |max| max + 1);
        let pool = |node: usize, device: Option<usize>| {
            Pool::new(Arc::clone(context), block_size, segment_size, node, device)
        };

        let host = (0..slots)
            .map(|node| host_nodes.contains(&node).then(|| pool(node, None)))
            .collect();
        let devices = match &context.device {
            Some(provider) => (0..slots)
                .map(|node| {
                    host_nodes.contains(&node).then(|| {
                        (0..provider.num_devices())
                            .map(|device| pool(node, Some(device)))
                            .collect()
                    })
                })
                .collect(),
            None => Box::default(),
        };

        Self {
            block_size,
            segment_size,
            host,
            devices,
        }
    }

    pub(crate) fn allocate(&self, node: usize) -> HeapResult<Block<R>> {
        self.host
            .get(node)
            .and_then(Option::as_ref)
            .ok_or(HeapError::UnknownNode { node })?
            .allocate()
    }

    pub(crate) fn allocate_on_device(&self, node: usize, device: usize) -> HeapResult<Block<R>> {
        if self.devices.is_empty() {
            return Err(HeapError::DeviceSupportDisabled);
        }
        self.devices
            .get(node)
            .and_then(Option::as_ref)
            .ok_or(HeapError::UnknownNode { node })?
            .get(device)
            .ok_or(HeapError::UnknownDevice { node, device })?
            .allocate()
    }

    fn pools(&self) -> impl Iterator<Item = &Pool<R>> {
        self.host.iter().flatten().chain(
            self.devices
                .iter()
                .flatten()
                .flat_map(|pools| pools.iter()),
        )
    }

    pub(crate) fn stats(&self) -> HeapStats {
        self.pools().map(Pool::stats).sum()
    }

    pub(crate) const fn block_size(&self) -> usize {
        self.block_size
    }

    #[cfg(test)]
    pub(crate) const fn segment_size(&self) -> usize {
        self.segment_size
    }
}

impl<R: Registrar> fmt::Debug for FixedSizeHeap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeHeap")
            .field("block_size", &self.block_size)
            .field("segment_size", &self.segment_size)
            .field("host_pools", &self.host.iter().flatten().count())
            .field("device_pools", &self.devices.iter().flatten().map(|p| p.len()).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedDevice;
    use crate::numa;
    use crate::register::LoopbackRegistrar;

    fn context(devices: usize) -> Arc<HeapContext<LoopbackRegistrar>> {
        Arc::new(HeapContext {
            registrar: Arc::new(LoopbackRegistrar::new()),
            numa: numa::system(),
            device: (devices > 0)
                .then(|| Arc::new(EmulatedDevice::new(devices)) as Arc<dyn crate::device::DeviceProvider>),
            never_free: false,
            num_reserve_segments: 0,
        })
    }

    #[test]
    fn test_routes_by_node() -> HeapResult<()> {
        let ctx = context(0);
        let node = ctx.numa.local_node();
        let heap = FixedSizeHeap::new(&ctx, 64, 4096);
        assert_eq!(heap.block_size(), 64);
        assert_eq!(heap.segment_size(), 4096);

        let block = heap.allocate(node)?;
        assert_eq!(block.size(), 64);
        assert_eq!(heap.stats().segments_created, 1);
        // SAFETY: outstanding block, released once.
        unsafe { block.release() };

        assert!(matches!(
            heap.allocate(usize::MAX / 2),
            Err(HeapError::UnknownNode { .. })
        ));
        assert!(matches!(
            heap.allocate_on_device(node, 0),
            Err(HeapError::DeviceSupportDisabled)
        ));
        Ok(())
    }

    #[test]
    fn test_routes_by_device() -> HeapResult<()> {
        let ctx = context(2);
        let node = ctx.numa.local_node();
        let heap = FixedSizeHeap::new(&ctx, 128, 4096);

        let block = heap.allocate_on_device(node, 1)?;
        assert!(block.device().is_some());
        // SAFETY: outstanding block, released once.
        unsafe { block.release() };

        assert!(matches!(
            heap.allocate_on_device(node, 2),
            Err(HeapError::UnknownDevice { device: 2, .. })
        ));
        Ok(())
    }
}
