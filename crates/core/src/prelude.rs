//! `rmaheap` Prelude
//!
//! Common imports for working with a heap.
//! Import this module to get the heap, its pointers and the provider traits.

// Re-export core types
pub use crate::allocator::{AllocatorBase, HeapAllocator};
pub use crate::config::{HeapConfig, HeapSettings};
pub use crate::error::{HeapError, HeapResult, NumaError, RegistrationError};
pub use crate::memory::{AnonymousHandle, Heap, HeapStats};
pub use crate::ptr::{HwPtr, HwVoidPtr, UniquePtr, UniqueSlice};

// Re-export collaborator seams
pub use crate::device::{DeviceProvider, EmulatedDevice};
pub use crate::numa::{NumaProvider, SystemNuma};
pub use crate::register::{
    LoopbackRegistrar, Region, RegionHandle, RegistrationFlags, Registrar, RmaHandle,
};

pub use std::sync::Arc;

/// Common result type alias
pub type Result<T> = HeapResult<T>;
