//! Heap Benchmarks
//!
//! Fast-path allocate/free per size class, batch churn that exercises the
//! slow-path collection, and contended allocation from several threads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rmaheap_core::{Heap, HeapConfig, HeapResult, HwVoidPtr, LoopbackRegistrar};
use std::sync::Arc;

const SIZES: &[usize] = &[16, 128, 1_024, 16_384, 262_144];
const BATCH: usize = 256;

fn heap() -> Heap<LoopbackRegistrar> {
    Heap::new(Arc::new(LoopbackRegistrar::new()), HeapConfig::default())
}

/// Single allocate/free pair; after warm-up every call stays on the lock-free path
fn bench_allocate_free(c: &mut Criterion) {
    let heap = heap();
    let node = heap.local_node();
    let mut group = c.benchmark_group("allocate_free");

    for &size in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                if let Ok(ptr) = heap.allocate(black_box(size), node) {
                    // SAFETY: issued above, freed once.
                    unsafe { heap.free(black_box(ptr)) };
                }
            });
        });
    }
    group.finish();
}

/// Allocate a batch, then free it; the next batch collects the deferred blocks
fn bench_batch_churn(c: &mut Criterion) {
    let heap = heap();
    let node = heap.local_node();
    let mut group = c.benchmark_group("batch_churn");
    group.throughput(Throughput::Elements(BATCH as u64));

    for &size in &SIZES[..3] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let batch: HeapResult<Vec<HwVoidPtr<LoopbackRegistrar>>> =
                    (0..BATCH).map(|_| heap.allocate(size, node)).collect();
                for ptr in batch.unwrap_or_default() {
                    // SAFETY: issued above, freed once.
                    unsafe { heap.free(ptr) };
                }
            });
        });
    }
    group.finish();
}

/// Four threads allocating from the same size class
fn bench_contended(c: &mut Criterion) {
    let heap = heap();
    let node = heap.local_node();

    c.bench_function("contended_allocate_free_4_threads", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        for _ in 0..BATCH {
                            if let Ok(ptr) = heap.allocate(black_box(64), node) {
                                // SAFETY: issued above, freed once.
                                unsafe { heap.free(ptr) };
                            }
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(heap_benches, bench_allocate_free, bench_batch_churn, bench_contended);
criterion_main!(heap_benches);
