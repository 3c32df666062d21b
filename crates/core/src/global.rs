//! Process-wide default heap
//!
//! Built on first use from `RMAHEAP_*` environment variables and never
//! dropped, so pointers from it stay valid until the process exits.

use crate::config::HeapConfig;
use crate::error::HeapResult;
use crate::memory::Heap;
use crate::register::LoopbackRegistrar;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

static DEFAULT_HEAP: OnceLock<Heap<LoopbackRegistrar>> = OnceLock::new();
static INIT: Mutex<()> = parking_lot::const_mutex(());

/// The default heap, creating it on first call
///
/// # Errors
///
/// Returns error if the environment describes an invalid configuration. A
/// failed initialization is retried on the next call.
pub fn default_heap() -> HeapResult<&'static Heap<LoopbackRegistrar>> {
    if let Some(heap) = DEFAULT_HEAP.get() {
        return Ok(heap);
    }

    let _guard = INIT.lock();
    if let Some(heap) = DEFAULT_HEAP.get() {
        return Ok(heap);
    }
    let config = HeapConfig::from_env()?;
    tracing::info!(version = crate::VERSION, ?config, "initializing default heap");
    Ok(DEFAULT_HEAP.get_or_init(|| Heap::new(Arc::new(LoopbackRegistrar::new()), config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heap_is_shared() -> HeapResult<()> {
        let a = default_heap()?;
        let b = default_heap()?;
        assert!(std::ptr::eq(a, b));

        let ptr = a.allocate(64, a.local_node())?;
        assert_eq!(ptr.size(), 64);
        // SAFETY: issued above, freed once.
        unsafe { b.free(ptr) };
        Ok(())
    }
}
