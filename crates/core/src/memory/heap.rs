//! Size-class routing
//!
//! A [`Heap`] maps every request to a fixed-size heap:
//! - sizes up to `tiny_limit` use linearly spaced classes, 8 bytes apart
//! - sizes up to `max_size` use power-of-two classes (small, large, and one
//!   class up to `max_size` whose segments hold a single block)
//! - anything larger goes to a lazily built heap keyed by the rounded size
//!
//! The huge map only grows; heaps created there live as long as the [`Heap`].

use crate::allocator::HeapAllocator;
use crate::config::{log2_c, round_up_pow2, HeapConfig, TINY_INCREMENT_SHIFT};
use crate::device::DeviceProvider;
use crate::error::{HeapError, HeapResult};
use crate::memory::block::Block;
use crate::memory::fixed_size_heap::FixedSizeHeap;
use crate::memory::stats::HeapStats;
use crate::memory::HeapContext;
use crate::numa::{self, NumaProvider};
use crate::ptr::{HwPtr, HwVoidPtr, UniquePtr, UniqueSlice};
use crate::register::{RegistrationFlags, Registrar};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Natural alignment of every block
const BLOCK_ALIGNMENT: usize = 8;

/// NUMA-aware, size-classed heap of registered memory
pub struct Heap<R: Registrar> {
    config: HeapConfig,
    context: Arc<HeapContext<R>>,
    tiny_heaps: Box<[FixedSizeHeap<R>]>,
    heaps: Box<[FixedSizeHeap<R>]>,
    huge_heaps: Mutex<HashMap<usize, Box<FixedSizeHeap<R>>>>,
}

impl<R: Registrar> Heap<R> {
    /// Heap on the host topology without device support
    #[must_use]
    pub fn new(registrar: Arc<R>, config: HeapConfig) -> Self {
        Self::with_providers(registrar, config, numa::system(), None)
    }

    /// Heap on explicit NUMA and device providers
    ///
    /// With a device provider every size class also gets one pool per
    /// node×device pair, reachable through [`Heap::allocate_on_device`].
    #[must_use]
    pub fn with_providers(
        registrar: Arc<R>,
        config: HeapConfig,
        numa: Arc<dyn NumaProvider>,
        device: Option<Arc<dyn DeviceProvider>>,
    ) -> Self {
        let context = Arc::new(HeapContext {
            registrar,
            numa,
            device,
            never_free: config.never_free(),
            num_reserve_segments: config.num_reserve_segments(),
        });

        let tiny_heaps = (0..config.num_tiny_heaps())
            .map(|i| {
                FixedSizeHeap::new(
                    &context,
                    (i + 1) << config.tiny_increment_shift(),
                    config.tiny_segment_size(),
                )
            })
            .collect();

        let num_small = config.num_small_heaps();
        let num_large = config.num_large_heaps();
        let num_buckets = exponential_bucket(config.max_size(), config.bucket_shift()) + 1;
        let heaps = (0..num_buckets)
            .map(|i| {
                if i < num_small {
                    FixedSizeHeap::new(
                        &context,
                        config.tiny_limit() << (i + 1),
                        config.small_segment_size(),
                    )
                } else if i < num_small + num_large {
                    FixedSizeHeap::new(
                        &context,
                        config.small_limit() << (i - num_small + 1),
                        config.large_segment_size(),
                    )
                } else {
                    let block_size = config.large_limit() << (i - num_small - num_large + 1);
                    FixedSizeHeap::new(&context, block_size, block_size)
                }
            })
            .collect();

        tracing::debug!(
            transport = context.registrar.transport(),
            nodes = ?context.numa.host_nodes(),
            devices = context.device.as_ref().map_or(0, |d| d.num_devices()),
            tiny = config.num_tiny_heaps(),
            exponential = num_buckets,
            max_size = config.max_size(),
            "heap created"
        );

        Self {
            config,
            context,
            tiny_heaps,
            heaps,
            huge_heaps: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate at least `size` bytes on `node`
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownNode`] for nodes without a pool, and the
    /// backing-store or registration error if the pool has to grow and cannot.
    pub fn allocate(&self, size: usize, node: usize) -> HeapResult<HwVoidPtr<R>> {
        let block = self.fixed_size_heap(size)?.allocate(node)?;
        Ok(HwVoidPtr::from_block(block))
    }

    /// Allocate at least `size` bytes on `node`, mirrored on `device`
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::DeviceSupportDisabled`] without a device provider,
    /// [`HeapError::UnknownNode`] or [`HeapError::UnknownDevice`] for ids
    /// without a pool, and growth errors as [`Heap::allocate`].
    pub fn allocate_on_device(
        &self,
        size: usize,
        node: usize,
        device: usize,
    ) -> HeapResult<HwVoidPtr<R>> {
        let block = self
            .fixed_size_heap(size)?
            .allocate_on_device(node, device)?;
        Ok(HwVoidPtr::from_block(block))
    }

    /// Return an allocation
    ///
    /// Pool blocks go back to their segment; user allocations drop their
    /// registration.
    ///
    /// # Safety
    ///
    /// `ptr` must have been issued by this heap and not freed yet, and no
    /// other copy of it may be used afterwards.
    pub unsafe fn free(&self, ptr: HwVoidPtr<R>) {
        // SAFETY: upheld by the caller; self keeps the pools alive.
        unsafe { ptr.into_block().release() };
    }

    /// Register caller memory and wrap it as a heap pointer
    ///
    /// The registration is dropped when the pointer is freed; the memory
    /// itself stays with the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes until the returned pointer is
    /// freed.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the range.
    pub unsafe fn register_user_allocation(
        &self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> HeapResult<HwVoidPtr<R>> {
        let region = self
            .context
            .registrar
            .register(ptr, size, RegistrationFlags::USER)?;
        Ok(HwVoidPtr::from_block(Block::from_user(region, ptr, size, false)))
    }

    /// Register caller memory living on `device`
    ///
    /// # Safety
    ///
    /// `ptr` must be valid device memory for `size` bytes until the returned
    /// pointer is freed.
    ///
    /// # Errors
    ///
    /// Returns error without device support, for an unknown device, or if the
    /// transport rejects the range.
    pub unsafe fn register_user_device_allocation(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        device: usize,
    ) -> HeapResult<HwVoidPtr<R>> {
        let provider = self
            .context
            .device
            .as_ref()
            .ok_or(HeapError::DeviceSupportDisabled)?;
        if device >= provider.num_devices() {
            return Err(HeapError::UnknownDevice {
                node: self.local_node(),
                device,
            });
        }
        let region = self.context.registrar.register_device(
            ptr,
            size,
            device,
            RegistrationFlags::USER,
        )?;
        Ok(HwVoidPtr::from_block(Block::from_user(region, ptr, size, true)))
    }

    /// Move `value` into a new allocation on `node`
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidSize`] if `T` is aligned beyond a page, and
    /// allocation errors as [`Heap::allocate`].
    pub fn make_unique<T>(&self, node: usize, value: T) -> HeapResult<UniquePtr<'_, T, R>> {
        let ptr = self.allocate_array::<T>(1, node)?;
        // SAFETY: the block is large enough and aligned for one T, and ours.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(UniquePtr::from_raw(self, ptr))
        }
    }

    /// Allocate `len` default-initialized elements on `node`
    ///
    /// # Errors
    ///
    /// See [`Heap::make_unique`].
    pub fn make_unique_slice<T: Default>(
        &self,
        node: usize,
        len: usize,
    ) -> HeapResult<UniqueSlice<'_, T, R>> {
        self.make_unique_slice_from_fn(node, len, |_| T::default())
    }

    /// Allocate `len` elements on `node`, element `i` initialized to `init(i)`
    ///
    /// If `init` panics, the elements built so far are dropped and the block
    /// is freed.
    ///
    /// # Errors
    ///
    /// See [`Heap::make_unique`].
    pub fn make_unique_slice_from_fn<T, F>(
        &self,
        node: usize,
        len: usize,
        mut init: F,
    ) -> HeapResult<UniqueSlice<'_, T, R>>
    where
        F: FnMut(usize) -> T,
    {
        let ptr = self.allocate_array::<T>(len, node)?;
        let mut guard = PartialInit {
            heap: self,
            ptr: Some(ptr.clone()),
            initialized: 0,
        };
        for i in 0..len {
            // SAFETY: i < len and the block holds len elements.
            unsafe { ptr.as_ptr().add(i).write(init(i)) };
            guard.initialized += 1;
        }
        guard.ptr = None;
        // SAFETY: all len elements are initialized and the block is ours.
        Ok(unsafe { UniqueSlice::from_raw(self, ptr, len) })
    }

    /// Typed allocator bound to `node`
    #[must_use]
    pub const fn allocator<T>(&self, node: usize) -> HeapAllocator<'_, T, R> {
        HeapAllocator::new(self, node)
    }

    /// Block size that serves a request of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidSize`] if `size` cannot be rounded to a
    /// power of two.
    pub fn size_class(&self, size: usize) -> HeapResult<usize> {
        let size = size.max(1);
        if size <= self.config.tiny_limit() {
            return Ok((tiny_bucket(size) + 1) << self.config.tiny_increment_shift());
        }
        if size <= self.config.max_size() {
            return self
                .heaps
                .get(exponential_bucket(size, self.config.bucket_shift()))
                .map(FixedSizeHeap::block_size)
                .ok_or(HeapError::InvalidSize { size });
        }
        round_up_pow2(size).ok_or(HeapError::InvalidSize { size })
    }

    fn fixed_size_heap(&self, size: usize) -> HeapResult<&FixedSizeHeap<R>> {
        let size = size.max(1);
        if size <= self.config.tiny_limit() {
            return self
                .tiny_heaps
                .get(tiny_bucket(size))
                .ok_or(HeapError::InvalidSize { size });
        }
        if size <= self.config.max_size() {
            return self
                .heaps
                .get(exponential_bucket(size, self.config.bucket_shift()))
                .ok_or(HeapError::InvalidSize { size });
        }
        self.huge_heap(size)
    }

    fn huge_heap(&self, size: usize) -> HeapResult<&FixedSizeHeap<R>> {
        let rounded = round_up_pow2(size).ok_or(HeapError::InvalidSize { size })?;
        let mut huge_heaps = self.huge_heaps.lock();
        let heap = huge_heaps.entry(rounded).or_insert_with(|| {
            tracing::debug!(block_size = rounded, "creating huge heap");
            Box::new(FixedSizeHeap::new(&self.context, rounded, rounded))
        });
        let heap = NonNull::from(heap.as_ref());
        drop(huge_heaps);
        // SAFETY: huge heaps are boxed and never removed before self is dropped.
        Ok(unsafe { heap.as_ref() })
    }

    fn allocate_array<T>(&self, count: usize, node: usize) -> HeapResult<HwPtr<T, R>> {
        let layout = Layout::array::<T>(count).map_err(|_| HeapError::InvalidSize {
            size: count.saturating_mul(std::mem::size_of::<T>()),
        })?;
        let size = self.request_size(layout)?;
        Ok(self.allocate(size, node)?.cast())
    }

    /// Bytes to request so the block satisfies `layout`
    ///
    /// Power-of-two blocks sit at multiples of their size from a page
    /// boundary, so over-aligned types get a power-of-two request.
    pub(crate) fn request_size(&self, layout: Layout) -> HeapResult<usize> {
        let size = layout.size().max(1);
        if layout.align() <= BLOCK_ALIGNMENT {
            return Ok(size);
        }
        if layout.align() > self.context.numa.page_size() {
            return Err(HeapError::InvalidSize { size });
        }
        round_up_pow2(size)
            .map(|rounded| rounded.max(layout.align()))
            .ok_or(HeapError::InvalidSize { size })
    }

    /// Aggregate statistics of every size class, huge heaps included
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats: HeapStats = self
            .tiny_heaps
            .iter()
            .chain(self.heaps.iter())
            .map(FixedSizeHeap::stats)
            .sum();
        stats += self.huge_heaps.lock().values().map(|h| h.stats()).sum::<HeapStats>();
        stats
    }

    /// Number of heaps created for sizes above [`Heap::max_size`]
    #[must_use]
    pub fn num_huge_heaps(&self) -> usize {
        self.huge_heaps.lock().len()
    }

    /// Largest size served without the huge map
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.config.max_size()
    }

    /// Configuration the heap was built with
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Whether device pools exist
    #[must_use]
    pub fn has_device_support(&self) -> bool {
        self.context.device.is_some()
    }

    /// Host nodes with pools
    #[must_use]
    pub fn host_nodes(&self) -> &[usize] {
        self.context.numa.host_nodes()
    }

    /// Node of the calling thread's CPU
    #[must_use]
    pub fn local_node(&self) -> usize {
        self.context.numa.local_node()
    }
}

impl<R: Registrar> fmt::Debug for Heap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("tiny_heaps", &self.tiny_heaps.len())
            .field("heaps", &self.heaps.len())
            .field("huge_heaps", &self.num_huge_heaps())
            .finish()
    }
}

/// Tiny class of `size`, for `1 <= size <= tiny_limit`
const fn tiny_bucket(size: usize) -> usize {
    (size - 1) >> TINY_INCREMENT_SHIFT
}

/// Exponential class of `size`, for `tiny_limit < size <= max_size`
const fn exponential_bucket(size: usize, bucket_shift: usize) -> usize {
    log2_c((size - 1) >> bucket_shift) - 1
}

/// Drops and frees a partially built slice if an initializer panics
struct PartialInit<'h, T, R: Registrar> {
    heap: &'h Heap<R>,
    ptr: Option<HwPtr<T, R>>,
    initialized: usize,
}

impl<T, R: Registrar> Drop for PartialInit<'_, T, R> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: the first `initialized` elements are live and the block
            // was issued by `heap` and not handed out.
            unsafe {
                std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                    ptr.as_ptr(),
                    self.initialized,
                ));
                self.heap.free(ptr.into_void());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapSettings;
    use crate::device::EmulatedDevice;
    use crate::register::{LoopbackRegistrar, RmaHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn heap() -> (LoopbackRegistrar, Heap<LoopbackRegistrar>) {
        let registrar = LoopbackRegistrar::new();
        let heap = Heap::new(Arc::new(registrar.clone()), HeapConfig::default());
        (registrar, heap)
    }

    #[test]
    fn test_heap_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Heap<LoopbackRegistrar>>();
    }

    #[test]
    fn test_bucket_arithmetic() {
        assert_eq!(tiny_bucket(1), 0);
        assert_eq!(tiny_bucket(8), 0);
        assert_eq!(tiny_bucket(9), 1);
        assert_eq!(tiny_bucket(128), 15);

        // Defaults: bucket_shift 7
        assert_eq!(exponential_bucket(129, 7), 0);
        assert_eq!(exponential_bucket(256, 7), 0);
        assert_eq!(exponential_bucket(257, 7), 1);
        assert_eq!(exponential_bucket(4096, 7), 4);
        assert_eq!(exponential_bucket(4097, 7), 5);
        assert_eq!(exponential_bucket(2 << 20, 7), 13);
        assert_eq!(exponential_bucket(4 << 20, 7), 14);
    }

    #[test]
    fn test_size_classes_with_defaults() -> HeapResult<()> {
        let (_, heap) = heap();
        assert_eq!(heap.tiny_heaps.len(), 16);
        assert_eq!(heap.heaps.len(), 15);
        assert_eq!(heap.max_size(), 4 << 20);

        assert_eq!(heap.size_class(0)?, 8);
        assert_eq!(heap.size_class(1)?, 8);
        assert_eq!(heap.size_class(17)?, 24);
        assert_eq!(heap.size_class(128)?, 128);
        assert_eq!(heap.size_class(129)?, 256);
        assert_eq!(heap.size_class(4096)?, 4096);
        assert_eq!(heap.size_class(4097)?, 8192);
        assert_eq!(heap.size_class(2 << 20)?, 2 << 20);
        assert_eq!(heap.size_class((2 << 20) + 1)?, 4 << 20);
        assert_eq!(heap.size_class((4 << 20) + 1)?, 8 << 20);
        assert!(heap.size_class(usize::MAX).is_err());

        let segments: Vec<(usize, usize)> = heap
            .heaps
            .iter()
            .map(|h| (h.block_size(), h.segment_size()))
            .collect();
        assert_eq!(segments.first(), Some(&(256, 64 << 10)));
        assert_eq!(segments.get(5), Some(&(8192, 2 << 20)));
        assert_eq!(segments.last(), Some(&(4 << 20, 4 << 20)));
        Ok(())
    }

    #[test]
    fn test_allocate_reports_class_size() -> HeapResult<()> {
        let (registrar, heap) = heap();
        let node = heap.local_node();
        for size in [1, 24, 100, 1000, 5000] {
            let ptr = heap.allocate(size, node)?;
            assert_eq!(ptr.size(), heap.size_class(size)?);
            assert_eq!(ptr.handle().address(), ptr.as_ptr());
            // SAFETY: issued above, freed once.
            unsafe { heap.free(ptr) };
        }
        assert!(registrar.stats().registered >= 5);
        Ok(())
    }

    #[test]
    fn test_huge_heaps_are_reused() -> HeapResult<()> {
        let (_, heap) = heap();
        let node = heap.local_node();
        let size = heap.max_size() + 1;

        let a = heap.allocate(size, node)?;
        assert_eq!(a.size(), heap.max_size() * 2);
        let b = heap.allocate(size + 4096, node)?;
        assert_eq!(heap.num_huge_heaps(), 1);
        // SAFETY: issued above, freed once.
        unsafe {
            heap.free(a);
            heap.free(b);
        }
        assert_eq!(heap.num_huge_heaps(), 1);
        Ok(())
    }

    #[test]
    fn test_unknown_node() {
        let (_, heap) = heap();
        assert!(matches!(
            heap.allocate(64, 4096),
            Err(HeapError::UnknownNode { node: 4096 })
        ));
    }

    #[test]
    fn test_device_allocation() -> HeapResult<()> {
        let registrar = LoopbackRegistrar::new();
        let device = Arc::new(EmulatedDevice::new(2));
        let heap = Heap::with_providers(
            Arc::new(registrar.clone()),
            HeapConfig::default(),
            numa::system(),
            Some(Arc::clone(&device) as Arc<dyn DeviceProvider>),
        );
        assert!(heap.has_device_support());
        let node = heap.local_node();

        let ptr = heap.allocate_on_device(512, node, 1)?;
        assert!(ptr.device_ptr().is_some());
        assert!(ptr.device_handle().is_some());
        assert!(device.live_bytes() > 0);
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };

        assert!(matches!(
            heap.allocate_on_device(512, node, 7),
            Err(HeapError::UnknownDevice { device: 7, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_device_disabled() {
        let (_, heap) = heap();
        assert!(!heap.has_device_support());
        let node = heap.local_node();
        assert!(matches!(
            heap.allocate_on_device(64, node, 0),
            Err(HeapError::DeviceSupportDisabled)
        ));
    }

    #[test]
    fn test_user_allocation_round_trip() -> HeapResult<()> {
        let (registrar, heap) = heap();
        let mut storage = vec![0u8; 300];
        let ptr = NonNull::new(storage.as_mut_ptr()).ok_or(HeapError::InvalidSize { size: 0 })?;

        // SAFETY: storage outlives the registration.
        let user = unsafe { heap.register_user_allocation(ptr, storage.len())? };
        assert!(user.is_user());
        assert_eq!(user.size(), 300);
        assert_eq!(user.as_ptr(), storage.as_mut_ptr());
        assert_eq!(registrar.stats().user, 1);
        assert_eq!(heap.stats().segments_created, 0);

        // SAFETY: issued above, freed once.
        unsafe { heap.free(user) };
        assert_eq!(registrar.stats().live(), 0);
        assert_eq!(storage.len(), 300);
        Ok(())
    }

    #[test]
    fn test_user_device_allocation_requires_device() {
        let (_, heap) = heap();
        let mut storage = [0u8; 64];
        let ptr = NonNull::from(&mut storage).cast::<u8>();
        // SAFETY: never registered.
        let result = unsafe { heap.register_user_device_allocation(ptr, 64, 0) };
        assert!(matches!(result, Err(HeapError::DeviceSupportDisabled)));
    }

    #[test]
    fn test_request_size_alignment() -> HeapResult<()> {
        let (_, heap) = heap();
        assert_eq!(heap.request_size(Layout::new::<u64>())?, 8);
        assert_eq!(heap.request_size(Layout::new::<[u8; 24]>())?, 24);
        let layout = |size, align| {
            Layout::from_size_align(size, align).map_err(|_| HeapError::InvalidSize { size })
        };
        assert_eq!(heap.request_size(layout(24, 32)?)?, 32);
        assert_eq!(heap.request_size(layout(100, 64)?)?, 128);
        assert!(heap.request_size(layout(8, 1 << 20)?).is_err());
        Ok(())
    }

    #[repr(align(64))]
    struct CacheLine([u8; 64]);

    #[test]
    fn test_make_unique_respects_alignment() -> HeapResult<()> {
        let (_, heap) = heap();
        let node = heap.local_node();
        let _pad = heap.make_unique(node, 1u8)?;
        let line = heap.make_unique(node, CacheLine([7; 64]))?;
        assert_eq!(line.hw_ptr().as_ptr() as usize % 64, 0);
        assert_eq!(line.0[63], 7);
        Ok(())
    }

    struct Counted<'a>(&'a AtomicUsize);

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_make_unique_slice_from_fn_drops_on_panic() {
        let (_, heap) = heap();
        let node = heap.local_node();
        let drops = AtomicUsize::new(0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            heap.make_unique_slice_from_fn(node, 8, |i| {
                assert!(i < 5, "initializer failure");
                Counted(&drops)
            })
        }));
        assert!(result.is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_small_config_routes_into_exponential_top() -> HeapResult<()> {
        let config = HeapConfig::new(HeapSettings {
            tiny_limit: 64,
            small_limit: 1024,
            large_limit: 16384,
            tiny_segment_size: 4096,
            small_segment_size: 16384,
            large_segment_size: 65536,
            ..HeapSettings::default()
        })?;
        let heap = Heap::new(Arc::new(LoopbackRegistrar::new()), config);
        assert_eq!(heap.max_size(), 32768);
        assert_eq!(heap.heaps.len(), config.num_small_heaps() + config.num_large_heaps() + 1);

        let node = heap.local_node();
        let ptr = heap.allocate(20000, node)?;
        assert_eq!(ptr.size(), 32768);
        assert_eq!(heap.num_huge_heaps(), 0);
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };
        Ok(())
    }
}
