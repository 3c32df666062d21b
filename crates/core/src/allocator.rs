//! Allocator adapters
//!
//! [`HeapAllocator`] hands out typed arrays from one node of a heap.
//! [`AllocatorBase`] is the same capability with the registrar type erased,
//! for code that stores allocators of different transports side by side.

use crate::error::{HeapError, HeapResult};
use crate::memory::block::Block;
use crate::memory::{AnonymousHandle, Heap};
use crate::ptr::HwPtr;
use crate::register::Registrar;
use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;

/// Typed allocator bound to one node of a [`Heap`]
///
/// Two adapters are equal when they allocate from the same heap and node,
/// so memory from one can be returned through the other.
pub struct HeapAllocator<'h, T, R: Registrar> {
    heap: &'h Heap<R>,
    node: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T, R: Registrar> HeapAllocator<'h, T, R> {
    /// Adapter allocating from `node` of `heap`
    #[must_use]
    pub const fn new(heap: &'h Heap<R>, node: usize) -> Self {
        Self {
            heap,
            node,
            _marker: PhantomData,
        }
    }

    /// Uninitialized storage for `count` values of `T`
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidSize`] if the array size overflows or `T`
    /// is aligned beyond a page, and allocation errors as [`Heap::allocate`].
    pub fn allocate(&self, count: usize) -> HeapResult<HwPtr<T, R>> {
        let layout = Layout::array::<T>(count).map_err(|_| HeapError::InvalidSize {
            size: count.saturating_mul(std::mem::size_of::<T>()),
        })?;
        let size = self.heap.request_size(layout)?;
        Ok(self.heap.allocate(size, self.node)?.cast())
    }

    /// Return storage obtained from [`HeapAllocator::allocate`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from an equal adapter and not be freed yet. Values
    /// stored in it are not dropped.
    pub unsafe fn deallocate(&self, ptr: HwPtr<T, R>, _count: usize) {
        // SAFETY: upheld by the caller.
        unsafe { self.heap.free(ptr.into_void()) };
    }

    /// Node the adapter allocates from
    #[must_use]
    pub const fn node(&self) -> usize {
        self.node
    }

    /// Heap the adapter allocates from
    #[must_use]
    pub const fn heap(&self) -> &'h Heap<R> {
        self.heap
    }

    /// Same heap and node, different element type
    #[must_use]
    pub const fn rebind<U>(&self) -> HeapAllocator<'h, U, R> {
        HeapAllocator::new(self.heap, self.node)
    }
}

impl<T, R: Registrar> Clone for HeapAllocator<'_, T, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, R: Registrar> Copy for HeapAllocator<'_, T, R> {}

impl<T, U, R: Registrar> PartialEq<HeapAllocator<'_, U, R>> for HeapAllocator<'_, T, R> {
    fn eq(&self, other: &HeapAllocator<'_, U, R>) -> bool {
        std::ptr::eq(self.heap, other.heap) && self.node == other.node
    }
}

impl<T, R: Registrar> Eq for HeapAllocator<'_, T, R> {}

impl<T, R: Registrar> fmt::Debug for HeapAllocator<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("heap", &std::ptr::from_ref(self.heap))
            .field("node", &self.node)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Registrar-independent allocation interface
pub trait AllocatorBase {
    /// Allocate at least `size` bytes
    ///
    /// # Errors
    ///
    /// Returns error if the allocation cannot be satisfied.
    fn allocate_untyped(&self, size: usize) -> HeapResult<AnonymousHandle>;

    /// Return an allocation
    ///
    /// # Safety
    ///
    /// `handle` must come from `allocate_untyped` on this allocator (or an
    /// equal one).
    unsafe fn deallocate_untyped(&self, handle: AnonymousHandle);
}

impl<T, R: Registrar> AllocatorBase for HeapAllocator<'_, T, R> {
    fn allocate_untyped(&self, size: usize) -> HeapResult<AnonymousHandle> {
        let ptr = self.heap.allocate(size, self.node)?;
        Ok(ptr.into_block().into_anonymous())
    }

    unsafe fn deallocate_untyped(&self, handle: AnonymousHandle) {
        // SAFETY: the handle was erased from a Block<R> of this heap.
        unsafe { Block::<R>::from_anonymous(handle).release() };
    }
}
