//! Memory Management - Segmented Size-Class Heap
//!
//! Implements the allocation hierarchy:
//! - [`Heap`] maps a requested size to a size class
//! - a fixed-size heap holds one pool per NUMA node (and per device)
//! - a pool owns registered segments and runs the concurrent free-list protocol
//! - a segment is one NUMA-pinned extent sliced into equal blocks
//!
//! All memory handed out is registered with the heap's [`Registrar`], so
//! every block carries transport keys usable for zero-copy transfers.

pub(crate) mod block;
pub(crate) mod fixed_size_heap;
pub mod heap;
pub(crate) mod pool;
pub(crate) mod segment;
pub mod stats;

pub use block::AnonymousHandle;
pub use heap::Heap;
pub use stats::{HeapStats, PoolStats};

use crate::device::DeviceProvider;
use crate::numa::NumaProvider;
use crate::register::Registrar;
use std::fmt;
use std::sync::Arc;

/// Collaborators and policy shared by every pool of one heap
pub(crate) struct HeapContext<R: Registrar> {
    pub(crate) registrar: Arc<R>,
    pub(crate) numa: Arc<dyn NumaProvider>,
    pub(crate) device: Option<Arc<dyn DeviceProvider>>,
    pub(crate) never_free: bool,
    pub(crate) num_reserve_segments: usize,
}

impl<R: Registrar> fmt::Debug for HeapContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapContext")
            .field("transport", &self.registrar.transport())
            .field("numa", &self.numa)
            .field("device", &self.device)
            .field("never_free", &self.never_free)
            .field("num_reserve_segments", &self.num_reserve_segments)
            .finish()
    }
}
