//! Benchmark: eden versus full collection pause times.
//!
//! Measures pause time for a heap with a long-lived old generation and a
//! stream of short-lived young cells, plus raw allocation throughput.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gengc::{
    Cell, CollectionRequest, CopiedBuffer, DeferGcForAWhile, Heap, HeapConfig, Strong, Trace,
    WriteBarrier,
};
use std::hint::black_box;
use std::time::{Duration, Instant};

#[derive(Trace, Cell)]
struct Node {
    value: i64,
    next: WriteBarrier,
}

#[derive(Trace, Cell)]
struct Blob {
    data: CopiedBuffer,
}

fn heap() -> Heap {
    Heap::new(HeapConfig::default().with_number_of_markers(1))
}

fn old_list(heap: &Heap, len: i64) -> Strong<Node> {
    let _defer = DeferGcForAWhile::new(heap);
    let mut head = heap.allocate(Node {
        value: 0,
        next: WriteBarrier::empty(),
    });
    for value in 1..len {
        head = heap.allocate(Node {
            value,
            next: WriteBarrier::new(head.into()),
        });
    }
    Strong::new(heap, head)
}

fn allocate_garbage(heap: &Heap, count: i64) {
    for value in 0..count {
        heap.allocate(Node {
            value,
            next: WriteBarrier::empty(),
        });
    }
}

fn bench_pause_by_kind(c: &mut Criterion) {
    let mut group = c.benchmark_group("pause_with_old_generation");
    for old in [1_000i64, 10_000, 100_000] {
        let heap = heap();
        let _root = old_list(&heap, old);
        heap.collect(CollectionRequest::Full);

        group.bench_with_input(BenchmarkId::new("eden", old), &old, |b, _| {
            b.iter_custom(|iterations| {
                let mut total = Duration::ZERO;
                for _ in 0..iterations {
                    allocate_garbage(&heap, 1_000);
                    let start = Instant::now();
                    black_box(heap.collect(CollectionRequest::Eden));
                    total += start.elapsed();
                }
                total
            });
        });
        group.bench_with_input(BenchmarkId::new("full", old), &old, |b, _| {
            b.iter_custom(|iterations| {
                let mut total = Duration::ZERO;
                for _ in 0..iterations {
                    allocate_garbage(&heap, 1_000);
                    let start = Instant::now();
                    black_box(heap.collect(CollectionRequest::Full));
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_throughput_alloc(c: &mut Criterion) {
    let heap = heap();
    c.bench_function("throughput_alloc_10000", |b| {
        b.iter(|| {
            allocate_garbage(&heap, 10_000);
            black_box(heap.object_count());
        });
    });
}

fn bench_lazy_sweep(c: &mut Criterion) {
    let heap = heap();
    c.bench_function("sweep_10000_dead_cells", |b| {
        b.iter_custom(|iterations| {
            let mut total = Duration::ZERO;
            for _ in 0..iterations {
                allocate_garbage(&heap, 10_000);
                heap.collect(CollectionRequest::Full);
                let start = Instant::now();
                while heap.sweep_next_block() {}
                total += start.elapsed();
            }
            total
        });
    });
}

fn bench_copy_phase(c: &mut Criterion) {
    c.bench_function("evacuate_sparse_storage", |b| {
        b.iter_custom(|iterations| {
            let mut total = Duration::ZERO;
            for _ in 0..iterations {
                let heap = heap();
                let mut kept = Vec::new();
                for i in 0..2_000 {
                    let blob = heap.allocate(Blob {
                        data: CopiedBuffer::new(&heap, 128),
                    });
                    if i % 16 == 0 {
                        kept.push(Strong::new(&heap, blob));
                    }
                }
                let start = Instant::now();
                heap.collect(CollectionRequest::Eden);
                total += start.elapsed();
                black_box(&kept);
            }
            total
        });
    });
}

criterion_group!(
    benches,
    bench_pause_by_kind,
    bench_throughput_alloc,
    bench_lazy_sweep,
    bench_copy_phase
);
criterion_main!(benches);
