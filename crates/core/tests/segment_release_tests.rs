//! Segment lifetime: release of empty segments, reserves and `never_free`

mod common;

use common::{compact_config, SimulatedNuma, TestResult};
use rmaheap_core::numa::NumaProvider;
use rmaheap_core::prelude::*;

fn heap_with(
    never_free: bool,
    reserve: usize,
) -> TestResult<(Arc<SimulatedNuma>, LoopbackRegistrar, Heap<LoopbackRegistrar>)> {
    let numa = Arc::new(SimulatedNuma::new(1));
    let registrar = LoopbackRegistrar::new();
    let heap = Heap::with_providers(
        Arc::new(registrar.clone()),
        compact_config(never_free, reserve)?,
        Arc::clone(&numa) as Arc<dyn NumaProvider>,
        None,
    );
    Ok((numa, registrar, heap))
}

/// Fill `count` one-page segments of 1 KiB blocks
fn fill(heap: &Heap<LoopbackRegistrar>, count: usize) -> HeapResult<Vec<HwVoidPtr<LoopbackRegistrar>>> {
    (0..count * 4).map(|_| heap.allocate(1024, 0)).collect()
}

#[test]
fn test_empty_segments_are_released() -> TestResult<()> {
    let (numa, registrar, heap) = heap_with(false, 0)?;
    let ptrs = fill(&heap, 3)?;
    assert_eq!(heap.stats().live_segments, 3);
    assert_eq!(registrar.stats().registered, 3);

    for ptr in ptrs {
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };
    }

    let stats = heap.stats();
    assert_eq!(stats.live_segments, 0);
    assert_eq!(stats.segments_released, 3);
    assert_eq!(registrar.stats().deregistered, 3);
    assert_eq!(numa.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_never_free_keeps_segments() -> TestResult<()> {
    let (numa, registrar, heap) = heap_with(true, 0)?;
    let ptrs = fill(&heap, 3)?;
    for ptr in ptrs {
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };
    }

    assert_eq!(heap.stats().live_segments, 3);
    assert_eq!(heap.stats().segments_released, 0);
    assert_eq!(registrar.stats().live(), 3);
    assert_eq!(numa.live_allocations(), 3);

    // Everything goes away with the heap.
    drop(heap);
    assert_eq!(registrar.stats().live(), 0);
    assert_eq!(numa.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_reserve_is_kept() -> TestResult<()> {
    let (_, _, heap) = heap_with(false, 2)?;
    let ptrs = fill(&heap, 5)?;
    for ptr in ptrs {
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };
    }

    let stats = heap.stats();
    assert_eq!(stats.live_segments, 2);
    assert_eq!(stats.segments_released, 3);
    Ok(())
}

#[test]
fn test_partially_used_segment_survives() -> TestResult<()> {
    let (_, _, heap) = heap_with(false, 0)?;
    let mut ptrs = fill(&heap, 2)?;
    let kept = ptrs.pop().ok_or("no pointers")?;
    for ptr in ptrs {
        // SAFETY: issued above, freed once.
        unsafe { heap.free(ptr) };
    }
    assert_eq!(heap.stats().live_segments, 1);

    // SAFETY: issued above, freed once.
    unsafe { heap.free(kept) };
    assert_eq!(heap.stats().live_segments, 0);
    Ok(())
}

#[test]
fn test_released_segment_is_rebuilt_on_demand() -> TestResult<()> {
    let (_, registrar, heap) = heap_with(false, 0)?;
    let ptr = heap.allocate(4096, 0)?;
    // SAFETY: issued above, freed once.
    unsafe { heap.free(ptr) };
    assert_eq!(heap.stats().live_segments, 0);

    let ptr = heap.allocate(4096, 0)?;
    assert_eq!(heap.stats().segments_created, 2);
    assert_eq!(registrar.stats().live(), 1);
    // SAFETY: issued above, freed once.
    unsafe { heap.free(ptr) };
    Ok(())
}
