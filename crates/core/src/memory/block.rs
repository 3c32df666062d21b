//! Blocks: the unit handed to callers
//!
//! A block is either a slice of a pool segment or a standalone user
//! registration. It caches its registration handle so callers never touch the
//! owning segment to read keys.

use crate::memory::segment::Segment;
use crate::register::{Region, RegionHandle, Registrar, RmaHandle};
use std::fmt;
use std::ptr::NonNull;

/// Device copy of a block
pub(crate) struct DeviceMirror<H> {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) handle: H,
}

impl<H: Clone> Clone for DeviceMirror<H> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            handle: self.handle.clone(),
        }
    }
}

/// Caller-owned memory with its own registration
pub(crate) struct UserRegion<R: Registrar> {
    region: R::Region,
    on_device: bool,
}

/// Where a block came from and where it goes back to
pub(crate) enum Origin<R: Registrar> {
    Segment(NonNull<Segment<R>>),
    User(NonNull<UserRegion<R>>),
}

impl<R: Registrar> Clone for Origin<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Registrar> Copy for Origin<R> {}

pub(crate) struct Block<R: Registrar> {
    origin: Origin<R>,
    ptr: NonNull<u8>,
    size: usize,
    handle: RegionHandle<R>,
    device: Option<DeviceMirror<RegionHandle<R>>>,
}

// SAFETY: a block is an address plus cached keys; the segment or user region
// it points back to is Send + Sync and outlives it by contract.
unsafe impl<R: Registrar> Send for Block<R> {}
unsafe impl<R: Registrar> Sync for Block<R> {}

impl<R: Registrar> Block<R> {
    pub(crate) fn from_segment(
        segment: NonNull<Segment<R>>,
        ptr: NonNull<u8>,
        size: usize,
        handle: RegionHandle<R>,
        device: Option<DeviceMirror<RegionHandle<R>>>,
    ) -> Self {
        Self {
            origin: Origin::Segment(segment),
            ptr,
            size,
            handle,
            device,
        }
    }

    /// Wrap caller memory registered as `region`
    ///
    /// The region is leaked into the block and reclaimed by [`Block::release`].
    pub(crate) fn from_user(region: R::Region, ptr: NonNull<u8>, size: usize, on_device: bool) -> Self {
        let handle = region.handle(0, size);
        let device = on_device.then(|| DeviceMirror {
            ptr,
            handle: handle.clone(),
        });
        let user = NonNull::from(Box::leak(Box::new(UserRegion { region, on_device })));
        Self {
            origin: Origin::User(user),
            ptr,
            size,
            handle,
            device,
        }
    }

    pub(crate) const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    pub(crate) const fn handle(&self) -> &RegionHandle<R> {
        &self.handle
    }

    pub(crate) fn handle_mut(&mut self) -> &mut RegionHandle<R> {
        &mut self.handle
    }

    pub(crate) fn device(&self) -> Option<&DeviceMirror<RegionHandle<R>>> {
        self.device.as_ref()
    }

    pub(crate) const fn is_user(&self) -> bool {
        matches!(self.origin, Origin::User(_))
    }

    /// Return the block to where it came from
    ///
    /// Segment blocks go back to their pool; user blocks drop their region.
    ///
    /// # Safety
    ///
    /// The block must be outstanding (not already released) and its heap must
    /// still be alive.
    pub(crate) unsafe fn release(self) {
        match self.origin {
            Origin::Segment(segment) => {
                // SAFETY: the segment is alive while this block is outstanding,
                // and its pool outlives it.
                let pool = unsafe { Segment::pool_of(segment) };
                pool.free(segment, self);
            }
            Origin::User(user) => {
                // SAFETY: leaked by from_user and released exactly once.
                drop(unsafe { Box::from_raw(user.as_ptr()) });
            }
        }
    }

    /// Erase the registrar type
    pub(crate) fn into_anonymous(self) -> AnonymousHandle {
        let origin = match self.origin {
            Origin::Segment(segment) => ErasedOrigin::Segment(segment.cast()),
            Origin::User(user) => ErasedOrigin::User(user.cast()),
        };
        AnonymousHandle {
            origin,
            address: self.ptr,
            size: self.size,
            provider_handle: Box::new(self.handle),
        }
    }

    /// Rebuild a block from an erased handle, re-deriving its keys from the owning region
    ///
    /// # Safety
    ///
    /// `handle` must come from [`Block::into_anonymous`] on a `Block<R>` of the
    /// same registrar type, and its origin must still be alive.
    pub(crate) unsafe fn from_anonymous(handle: AnonymousHandle) -> Self {
        let AnonymousHandle {
            origin,
            address,
            size,
            ..
        } = handle;
        match origin {
            ErasedOrigin::Segment(segment) => {
                let segment = segment.cast::<Segment<R>>();
                // SAFETY: the segment is alive per the caller contract.
                unsafe { segment.as_ref() }.block_at(segment, address)
            }
            ErasedOrigin::User(user) => {
                let user = user.cast::<UserRegion<R>>();
                // SAFETY: the user region is alive per the caller contract.
                let region = unsafe { user.as_ref() };
                let block_handle = region.region.handle(0, size);
                let device = region.on_device.then(|| DeviceMirror {
                    ptr: address,
                    handle: block_handle.clone(),
                });
                Self {
                    origin: Origin::User(user),
                    ptr: address,
                    size,
                    handle: block_handle,
                    device,
                }
            }
        }
    }
}

impl<R: Registrar> Clone for Block<R> {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin,
            ptr: self.ptr,
            size: self.size,
            handle: self.handle.clone(),
            device: self.device.clone(),
        }
    }
}

impl<R: Registrar> fmt::Debug for Block<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("user", &self.is_user())
            .field("handle", &self.handle)
            .field("device_ptr", &self.device.as_ref().map(|d| d.ptr))
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum ErasedOrigin {
    Segment(NonNull<()>),
    User(NonNull<()>),
}

/// Registrar-independent view of an allocation
///
/// Carries the same fields as a typed pointer (origin, address, size and
/// transport keys) with the registration handle boxed behind [`RmaHandle`].
/// Move-only: each handle is released exactly once.
#[derive(Debug)]
pub struct AnonymousHandle {
    origin: ErasedOrigin,
    address: NonNull<u8>,
    size: usize,
    provider_handle: Box<dyn RmaHandle>,
}

// SAFETY: see Block; the boxed handle is Send + Sync by the RmaHandle bound.
unsafe impl Send for AnonymousHandle {}
unsafe impl Sync for AnonymousHandle {}

impl AnonymousHandle {
    /// Start of the allocation
    #[must_use]
    pub const fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Usable size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Transport keys of the allocation
    #[must_use]
    pub fn provider_handle(&self) -> &dyn RmaHandle {
        self.provider_handle.as_ref()
    }

    /// Mutable transport keys, for message-length bookkeeping
    pub fn provider_handle_mut(&mut self) -> &mut dyn RmaHandle {
        self.provider_handle.as_mut()
    }

    /// Whether the allocation wraps caller-owned memory
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self.origin, ErasedOrigin::User(_))
    }
}
