//! Fancy pointers
//!
//! Pointers returned by the heap carry their block: the address, the
//! registration handle with transport keys, the device mirror if any, and the
//! route back to the owning segment. [`HwVoidPtr`] and [`HwPtr`] behave like
//! raw pointers and must not outlive their heap. [`UniquePtr`] and
//! [`UniqueSlice`] borrow the heap and free on drop.

use crate::memory::block::Block;
use crate::memory::Heap;
use crate::register::{RegionHandle, Registrar};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

/// Untyped pointer to heap memory
pub struct HwVoidPtr<R: Registrar> {
    block: Block<R>,
}

impl<R: Registrar> HwVoidPtr<R> {
    pub(crate) const fn from_block(block: Block<R>) -> Self {
        Self { block }
    }

    pub(crate) fn into_block(self) -> Block<R> {
        self.block
    }

    /// Host address
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.block.ptr().as_ptr()
    }

    /// Device address of the mirrored block
    #[must_use]
    pub fn device_ptr(&self) -> Option<*mut u8> {
        self.block.device().map(|mirror| mirror.ptr.as_ptr())
    }

    /// Usable size in bytes (the block size of the size class)
    #[must_use]
    pub const fn size(&self) -> usize {
        self.block.size()
    }

    /// Registration handle of the host block
    #[must_use]
    pub const fn handle(&self) -> &RegionHandle<R> {
        self.block.handle()
    }

    /// Mutable registration handle, for message-length bookkeeping
    pub fn handle_mut(&mut self) -> &mut RegionHandle<R> {
        self.block.handle_mut()
    }

    /// Registration handle of the device block
    #[must_use]
    pub fn device_handle(&self) -> Option<&RegionHandle<R>> {
        self.block.device().map(|mirror| &mirror.handle)
    }

    /// Whether the pointer wraps caller-owned memory
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.block.is_user()
    }

    /// Reinterpret as a pointer to `T`
    #[must_use]
    pub fn cast<T>(self) -> HwPtr<T, R> {
        HwPtr {
            raw: self,
            _marker: PhantomData,
        }
    }
}

impl<R: Registrar> Clone for HwVoidPtr<R> {
    fn clone(&self) -> Self {
        Self {
            block: self.block.clone(),
        }
    }
}

impl<R: Registrar> PartialEq for HwVoidPtr<R> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<R: Registrar> Eq for HwVoidPtr<R> {}

impl<R: Registrar> Hash for HwVoidPtr<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state);
    }
}

impl<R: Registrar> fmt::Debug for HwVoidPtr<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HwVoidPtr").field(&self.block).finish()
    }
}

/// Typed pointer to heap memory
pub struct HwPtr<T, R: Registrar> {
    raw: HwVoidPtr<R>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, R: Registrar> HwPtr<T, R> {
    /// Typed host address
    #[must_use]
    pub const fn as_ptr(&self) -> *mut T {
        self.raw.as_ptr().cast()
    }

    /// Typed device address of the mirrored block
    #[must_use]
    pub fn device_ptr(&self) -> Option<*mut T> {
        self.raw.device_ptr().map(<*mut u8>::cast)
    }

    /// Registration handle of the host block
    #[must_use]
    pub const fn handle(&self) -> &RegionHandle<R> {
        self.raw.handle()
    }

    /// Untyped view
    #[must_use]
    pub const fn as_void(&self) -> &HwVoidPtr<R> {
        &self.raw
    }

    /// Drop the type
    #[must_use]
    pub fn into_void(self) -> HwVoidPtr<R> {
        self.raw
    }

    /// Reinterpret as a pointer to `U`
    #[must_use]
    pub fn cast<U>(self) -> HwPtr<U, R> {
        self.raw.cast()
    }
}

impl<T, R: Registrar> Clone for HwPtr<T, R> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, R: Registrar> PartialEq for HwPtr<T, R> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T, R: Registrar> Eq for HwPtr<T, R> {}

impl<T, R: Registrar> fmt::Debug for HwPtr<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HwPtr").field(&self.raw.block).finish()
    }
}

/// Owning pointer to one `T` on the heap
///
/// Drops the value and frees the block when dropped.
pub struct UniquePtr<'h, T, R: Registrar> {
    heap: &'h Heap<R>,
    ptr: HwPtr<T, R>,
    _owns: PhantomData<T>,
}

impl<'h, T, R: Registrar> UniquePtr<'h, T, R> {
    /// # Safety
    ///
    /// `ptr` must point to an initialized `T` in a block issued by `heap`
    /// and owned by no one else.
    pub(crate) const unsafe fn from_raw(heap: &'h Heap<R>, ptr: HwPtr<T, R>) -> Self {
        Self {
            heap,
            ptr,
            _owns: PhantomData,
        }
    }

    /// Fancy pointer to the value
    #[must_use]
    pub const fn hw_ptr(&self) -> &HwPtr<T, R> {
        &self.ptr
    }

    /// Registration handle of the block holding the value
    #[must_use]
    pub const fn handle(&self) -> &RegionHandle<R> {
        self.ptr.handle()
    }
}

impl<T, R: Registrar> Deref for UniquePtr<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized and uniquely owned.
        unsafe { &*self.ptr.as_ptr() }
    }
}

impl<T, R: Registrar> DerefMut for UniquePtr<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: initialized and uniquely owned.
        unsafe { &mut *self.ptr.as_ptr() }
    }
}

impl<T: fmt::Debug, R: Registrar> fmt::Debug for UniquePtr<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UniquePtr").field(&**self).finish()
    }
}

impl<T, R: Registrar> Drop for UniquePtr<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and owned by us; the block was
        // issued by `heap` and is freed exactly once.
        unsafe {
            std::ptr::drop_in_place(self.ptr.as_ptr());
            self.heap.free(self.ptr.clone().into_void());
        }
    }
}

/// Owning pointer to `len` contiguous `T` on the heap
///
/// Drops every element and frees the block when dropped.
pub struct UniqueSlice<'h, T, R: Registrar> {
    heap: &'h Heap<R>,
    ptr: HwPtr<T, R>,
    len: usize,
    _owns: PhantomData<T>,
}

impl<'h, T, R: Registrar> UniqueSlice<'h, T, R> {
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized `T` in a block issued by `heap`
    /// and owned by no one else.
    pub(crate) const unsafe fn from_raw(heap: &'h Heap<R>, ptr: HwPtr<T, R>, len: usize) -> Self {
        Self {
            heap,
            ptr,
            len,
            _owns: PhantomData,
        }
    }

    /// Fancy pointer to the first element
    #[must_use]
    pub const fn hw_ptr(&self) -> &HwPtr<T, R> {
        &self.ptr
    }

    /// Registration handle of the block holding the elements
    #[must_use]
    pub const fn handle(&self) -> &RegionHandle<R> {
        self.ptr.handle()
    }
}

impl<T, R: Registrar> Deref for UniqueSlice<'_, T, R> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: len initialized elements, uniquely owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, R: Registrar> DerefMut for UniqueSlice<'_, T, R> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: len initialized elements, uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: fmt::Debug, R: Registrar> fmt::Debug for UniqueSlice<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, R: Registrar> Drop for UniqueSlice<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: the elements are initialized and owned by us; the block was
        // issued by `heap` and is freed exactly once.
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ));
            self.heap.free(self.ptr.clone().into_void());
        }
    }
}
