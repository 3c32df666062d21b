//! Device Memory
//!
//! [`DeviceProvider`] abstracts raw accelerator memory. Device pools mirror
//! every host segment with an equally sized device extent. [`EmulatedDevice`]
//! stands in for real hardware with host memory.

use crate::error::DeviceError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Alignment of emulated device allocations
const DEVICE_ALIGNMENT: usize = 256;

thread_local! {
    // Current device, per thread like a driver context.
    static CURRENT_DEVICE: Cell<usize> = const { Cell::new(0) };
}

/// Raw device allocation and copy primitives
pub trait DeviceProvider: Send + Sync + fmt::Debug {
    /// Number of visible devices
    fn num_devices(&self) -> usize;

    /// Device selected for the calling thread
    fn device_id(&self) -> usize;

    /// Select the device for subsequent calls on the calling thread
    ///
    /// # Errors
    ///
    /// Returns error if `device` is out of range.
    fn set_device_id(&self, device: usize) -> Result<(), DeviceError>;

    /// Allocate `size` zeroed bytes on the current device
    ///
    /// # Errors
    ///
    /// Returns error if the device is out of memory.
    fn malloc(&self, size: usize) -> Result<NonNull<u8>, DeviceError>;

    /// Release device memory
    ///
    /// # Safety
    ///
    /// `ptr` must come from `self.malloc(size)` and must not be released twice.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);

    /// Copy `len` bytes from host to device
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `len` bytes and must not overlap.
    unsafe fn memcpy_to_device(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize);

    /// Copy `len` bytes from device to host
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `len` bytes and must not overlap.
    unsafe fn memcpy_to_host(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize);
}

/// Device memory released through its provider on drop
pub struct DeviceExtent {
    provider: Arc<dyn DeviceProvider>,
    ptr: NonNull<u8>,
    size: usize,
    device: usize,
}

impl DeviceExtent {
    /// Allocate `size` bytes on `device`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be selected or is out of memory.
    pub fn allocate(
        provider: Arc<dyn DeviceProvider>,
        size: usize,
        device: usize,
    ) -> Result<Self, DeviceError> {
        provider.set_device_id(device)?;
        let ptr = provider.malloc(size)?;
        Ok(Self {
            provider,
            ptr,
            size,
            device,
        })
    }

    /// Start of the device extent
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Device the extent lives on
    #[must_use]
    pub const fn device(&self) -> usize {
        self.device
    }
}

// SAFETY: the extent is exclusively owned; the provider is Send + Sync.
unsafe impl Send for DeviceExtent {}
unsafe impl Sync for DeviceExtent {}

impl fmt::Debug for DeviceExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceExtent")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceExtent {
    fn drop(&mut self) {
        // SAFETY: ptr came from provider.malloc(size) and is released once.
        unsafe { self.provider.free(self.ptr, self.size) };
    }
}

/// Host memory posing as device memory
///
/// The selected device is thread-local and shared by every instance, so
/// concurrent growth of pools on different devices cannot interleave.
#[derive(Debug)]
pub struct EmulatedDevice {
    num_devices: usize,
    live_bytes: AtomicUsize,
}

impl EmulatedDevice {
    /// Emulate `num_devices` devices
    #[must_use]
    pub const fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated across all emulated devices
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn layout(size: usize) -> Result<Layout, DeviceError> {
        Layout::from_size_align(size.max(1), DEVICE_ALIGNMENT)
            .map_err(|_| DeviceError::AllocationFailed { size, device: 0 })
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DeviceProvider for EmulatedDevice {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn device_id(&self) -> usize {
        CURRENT_DEVICE.with(Cell::get)
    }

    fn set_device_id(&self, device: usize) -> Result<(), DeviceError> {
        if device >= self.num_devices {
            return Err(DeviceError::InvalidDevice { device });
        }
        CURRENT_DEVICE.with(|current| current.set(device));
        Ok(())
    }

    fn malloc(&self, size: usize) -> Result<NonNull<u8>, DeviceError> {
        let layout = Self::layout(size)?;
        // SAFETY: layout size is at least one byte.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(DeviceError::AllocationFailed {
            size,
            device: self.device_id(),
        })?;
        self.live_bytes.fetch_add(layout.size(), Ordering::Relaxed);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if let Ok(layout) = Self::layout(size) {
            self.live_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
            // SAFETY: ptr came from malloc with the same layout.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }

    unsafe fn memcpy_to_device(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize) {
        // SAFETY: upheld by the caller.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
    }

    unsafe fn memcpy_to_host(&self, dst: NonNull<u8>, src: NonNull<u8>, len: usize) {
        // SAFETY: upheld by the caller.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
    }
}
