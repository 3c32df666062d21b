//! `rmaheap` Core - NUMA-Aware Heap of RMA-Registered Memory
//!
//! This crate provides a size-classed allocator whose memory is pinned to NUMA
//! nodes and registered with a remote-memory-access transport, so every
//! allocation can be used for zero-copy transfers without per-call registration.
//!
//! # Features
//!
//! - **Size classes**: tiny (8-byte spacing), small and large (powers of two), huge on demand
//! - **NUMA placement**: one pool per node, backed by node-bound pages
//! - **Registration**: every segment is registered once; blocks carry their keys
//! - **Lock-free fast path**: allocate and free never take a lock unless a pool grows
//! - **Device mirrors**: optional per node×device pools with host and device addresses
//!
//! # Architecture
//!
//! - [`memory`] - the heap, fixed-size heaps, pools, segments and blocks
//! - [`config`] - validated size-class configuration
//! - [`numa`], [`device`], [`register`] - collaborator seams with reference backends
//! - [`ptr`] - fancy pointers and scope owners
//! - [`allocator`] - typed and type-erased allocator adapters
//! - [`global`] - the process-wide default heap
//!
//! # Example
//!
//! ```rust
//! use rmaheap_core::prelude::*;
//!
//! fn main() -> HeapResult<()> {
//!     let registrar = Arc::new(LoopbackRegistrar::new());
//!     let heap = Heap::new(registrar, HeapConfig::default());
//!     let node = heap.local_node();
//!
//!     let ptr = heap.allocate(100, node)?;
//!     assert_eq!(ptr.size(), 104);
//!     println!("remote key {}", ptr.handle().remote_key());
//!     // SAFETY: allocated above and freed once.
//!     unsafe { heap.free(ptr) };
//!
//!     let values = heap.make_unique_slice_from_fn(node, 4, |i| i * 10)?;
//!     assert_eq!(values[3], 30);
//!     Ok(())
//! }
//! ```

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::large_stack_arrays,
    clippy::indexing_slicing,
    missing_docs
)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::correctness,
    clippy::suspicious,
    clippy::perf,
    clippy::style,
    clippy::complexity,
    clippy::diverging_sub_expression,
    clippy::unreachable,
    clippy::redundant_pattern_matching,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::needless_pass_by_ref_mut,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::undocumented_unsafe_blocks
)]
#![allow(clippy::multiple_crate_versions, clippy::module_name_repetitions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Public modules
pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
pub mod global;
pub mod memory;
pub mod numa;
pub mod prelude;
pub mod ptr;
pub mod register;

// Re-exports for convenience
pub use allocator::{AllocatorBase, HeapAllocator};
pub use config::{HeapConfig, HeapSettings};
pub use error::{DeviceError, HeapError, HeapResult, NumaError, NumaResult, RegistrationError};
pub use memory::{AnonymousHandle, Heap, HeapStats};
pub use ptr::{HwPtr, HwVoidPtr, UniquePtr, UniqueSlice};
pub use register::{LoopbackRegistrar, RegistrationFlags, Registrar};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
