//! Memory Registration
//!
//! Transports make memory remotely accessible by registering it. A
//! [`Registrar`] turns an address range into a move-only [`Region`] that mints
//! lightweight [`RmaHandle`]s for sub-ranges and deregisters when dropped.
//! The heap is generic over the registrar, so the backend is chosen statically.

use crate::error::RegistrationError;
use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Options passed to [`Registrar::register`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegistrationFlags(u32);

impl RegistrationFlags {
    /// Heap-owned memory
    pub const NONE: Self = Self(0);
    /// Caller-owned memory; the region never releases the backing store
    pub const USER: Self = Self(1);

    /// Raw bit representation
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RegistrationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Transport keys for one registered sub-range
pub trait RmaHandle: Send + Sync + fmt::Debug {
    /// Key used by local transport operations
    fn local_key(&self) -> u64;

    /// Key a peer needs to access the range
    fn remote_key(&self) -> u64;

    /// Start of the sub-range
    fn address(&self) -> *mut u8;

    /// Length of the message staged in this range
    fn message_length(&self) -> usize {
        0
    }

    /// Record the length of the message staged in this range
    fn set_message_length(&mut self, _len: usize) {}
}

/// A live registration covering one contiguous range
///
/// Dropping the region deregisters it.
pub trait Region: Send + Sync + 'static {
    /// Handle minted for sub-ranges
    type Handle: RmaHandle + Clone + 'static;

    /// Handle for `len` bytes starting `offset` bytes into the region
    fn handle(&self, offset: usize, len: usize) -> Self::Handle;
}

/// Transport-specific registration backend
pub trait Registrar: Send + Sync + 'static {
    /// Region produced by this backend
    type Region: Region;

    /// Backend name used in diagnostics
    fn transport(&self) -> &'static str;

    /// Register `len` bytes of host memory starting at `ptr`
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the range.
    fn register(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        flags: RegistrationFlags,
    ) -> Result<Self::Region, RegistrationError>;

    /// Register `len` bytes of memory on `device`
    ///
    /// Backends without device support register the range like host memory.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the range.
    fn register_device(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        _device: usize,
        flags: RegistrationFlags,
    ) -> Result<Self::Region, RegistrationError> {
        self.register(ptr, len, flags)
    }
}

/// Handle type minted by the regions of `R`
pub type RegionHandle<R> = <<R as Registrar>::Region as Region>::Handle;

/// Registration counters of a [`LoopbackRegistrar`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationStats {
    /// Successful registrations
    pub registered: u64,
    /// Regions dropped
    pub deregistered: u64,
    /// Registrations flagged as user memory
    pub user: u64,
    /// Registrations of device memory
    pub device: u64,
    /// Rejected registrations
    pub rejected: u64,
}

impl RegistrationStats {
    /// Regions currently registered
    #[must_use]
    pub const fn live(&self) -> u64 {
        self.registered.saturating_sub(self.deregistered)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_key: AtomicU64,
    registered: AtomicU64,
    deregistered: AtomicU64,
    user: AtomicU64,
    device: AtomicU64,
    rejected: AtomicU64,
    fail_after: Option<u64>,
}

/// In-process registrar
///
/// Local keys are sequential region ids and remote keys are addresses, so
/// handles are unique and checkable without a network. Counts every
/// registration and deregistration.
#[derive(Debug, Clone, Default)]
pub struct LoopbackRegistrar {
    state: Arc<LoopbackState>,
}

impl LoopbackRegistrar {
    /// Registrar that accepts every range
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrar that rejects every registration after the first `count`
    #[must_use]
    pub fn failing_after(count: u64) -> Self {
        Self {
            state: Arc::new(LoopbackState {
                fail_after: Some(count),
                ..LoopbackState::default()
            }),
        }
    }

    /// Snapshot of the registration counters
    #[must_use]
    pub fn stats(&self) -> RegistrationStats {
        RegistrationStats {
            registered: self.state.registered.load(Ordering::Acquire),
            deregistered: self.state.deregistered.load(Ordering::Acquire),
            user: self.state.user.load(Ordering::Acquire),
            device: self.state.device.load(Ordering::Acquire),
            rejected: self.state.rejected.load(Ordering::Acquire),
        }
    }

    fn admit(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        device: Option<usize>,
        flags: RegistrationFlags,
    ) -> Result<LoopbackRegion, RegistrationError> {
        let address = ptr.as_ptr() as usize;
        if len == 0 {
            self.state.rejected.fetch_add(1, Ordering::AcqRel);
            return Err(RegistrationError::new(self.transport(), address, len, "empty range"));
        }
        if let Some(limit) = self.state.fail_after {
            if self.state.registered.load(Ordering::Acquire) >= limit {
                self.state.rejected.fetch_add(1, Ordering::AcqRel);
                return Err(RegistrationError::new(
                    self.transport(),
                    address,
                    len,
                    format!("registration limit of {limit} reached"),
                ));
            }
        }

        let key = self.state.next_key.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.registered.fetch_add(1, Ordering::AcqRel);
        if flags.contains(RegistrationFlags::USER) {
            self.state.user.fetch_add(1, Ordering::AcqRel);
        }
        if device.is_some() {
            self.state.device.fetch_add(1, Ordering::AcqRel);
        }
        tracing::trace!(key, address, len, ?device, "registered region");

        Ok(LoopbackRegion {
            key,
            base: address,
            len,
            flags,
            device,
            state: Arc::clone(&self.state),
        })
    }
}

impl Registrar for LoopbackRegistrar {
    type Region = LoopbackRegion;

    fn transport(&self) -> &'static str {
        "loopback"
    }

    fn register(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        flags: RegistrationFlags,
    ) -> Result<LoopbackRegion, RegistrationError> {
        self.admit(ptr, len, None, flags)
    }

    fn register_device(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        device: usize,
        flags: RegistrationFlags,
    ) -> Result<LoopbackRegion, RegistrationError> {
        self.admit(ptr, len, Some(device), flags)
    }
}

/// Region registered by a [`LoopbackRegistrar`]
#[derive(Debug)]
pub struct LoopbackRegion {
    key: u64,
    base: usize,
    len: usize,
    flags: RegistrationFlags,
    device: Option<usize>,
    state: Arc<LoopbackState>,
}

impl LoopbackRegion {
    /// Region key
    #[must_use]
    pub const fn key(&self) -> u64 {
        self.key
    }

    /// Registered length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flags given at registration
    #[must_use]
    pub const fn flags(&self) -> RegistrationFlags {
        self.flags
    }

    /// Device the region lives on, if any
    #[must_use]
    pub const fn device(&self) -> Option<usize> {
        self.device
    }
}

impl Region for LoopbackRegion {
    type Handle = LoopbackHandle;

    fn handle(&self, offset: usize, len: usize) -> LoopbackHandle {
        let address = self.base + offset;
        LoopbackHandle {
            local_key: self.key,
            remote_key: address as u64,
            address,
            len,
            message_length: 0,
        }
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.state.deregistered.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(key = self.key, address = self.base, "deregistered region");
    }
}

/// Handle minted by a [`LoopbackRegion`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackHandle {
    local_key: u64,
    remote_key: u64,
    address: usize,
    len: usize,
    message_length: usize,
}

impl LoopbackHandle {
    /// Length of the sub-range
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the sub-range is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RmaHandle for LoopbackHandle {
    fn local_key(&self) -> u64 {
        self.local_key
    }

    fn remote_key(&self) -> u64 {
        self.remote_key
    }

    fn address(&self) -> *mut u8 {
        self.address as *mut u8
    }

    fn message_length(&self) -> usize {
        self.message_length
    }

    fn set_message_length(&mut self, len: usize) {
        self.message_length = len;
    }
}
