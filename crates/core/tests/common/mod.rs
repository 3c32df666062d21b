//! Shared fixtures for integration tests

#![allow(dead_code)]

use rmaheap_core::numa::{Allocation, NumaProvider};
use rmaheap_core::{HeapConfig, HeapResult, HeapSettings, NumaError, NumaResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const PAGE_SIZE: usize = 4096;

/// Two host nodes backed by ordinary page-aligned heap memory
#[derive(Debug)]
pub struct SimulatedNuma {
    nodes: Vec<usize>,
    misplace_on: Option<usize>,
    live: AtomicUsize,
}

impl SimulatedNuma {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            nodes: (0..num_nodes).collect(),
            misplace_on: None,
            live: AtomicUsize::new(0),
        }
    }

    /// Report every allocation as resident on `node`
    pub fn misplacing_on(num_nodes: usize, node: usize) -> Self {
        Self {
            misplace_on: Some(node),
            ..Self::new(num_nodes)
        }
    }

    /// Allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl NumaProvider for SimulatedNuma {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn host_nodes(&self) -> &[usize] {
        &self.nodes
    }

    fn device_nodes(&self) -> &[usize] {
        &[]
    }

    fn allowed_nodes(&self) -> &[usize] {
        &self.nodes
    }

    fn preferred_node(&self) -> usize {
        0
    }

    fn local_node(&self) -> usize {
        0
    }

    fn allocate(&self, num_pages: usize, node: usize) -> NumaResult<Allocation> {
        if !self.can_allocate_on(node) {
            return Err(NumaError::NodeNotAvailable { node });
        }
        let size = num_pages * PAGE_SIZE;
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| NumaError::InvalidSize { size })?;
        // SAFETY: size is non-zero.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(
            NumaError::AllocationFailed {
                size,
                node,
                reason: "out of memory".into(),
            },
        )?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Allocation {
            ptr,
            size,
            node: self.misplace_on.unwrap_or(node),
            uses_numa_free: false,
        })
    }

    unsafe fn free(&self, allocation: &Allocation) {
        if let Ok(layout) = Layout::from_size_align(allocation.size, PAGE_SIZE) {
            // SAFETY: allocated above with the same layout.
            unsafe { dealloc(allocation.ptr.as_ptr(), layout) };
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Small classes on one-page segments so tests exercise growth and release quickly
pub fn compact_config(never_free: bool, num_reserve_segments: usize) -> HeapResult<HeapConfig> {
    HeapConfig::new(HeapSettings {
        never_free,
        num_reserve_segments,
        tiny_limit: 64,
        small_limit: 1024,
        large_limit: 4096,
        tiny_segment_size: PAGE_SIZE,
        small_segment_size: PAGE_SIZE,
        large_segment_size: PAGE_SIZE,
    })
}
