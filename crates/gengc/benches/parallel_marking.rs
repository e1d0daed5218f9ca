//! Benchmark: marking throughput by marker thread count.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gengc::{
    Cell, CollectionRequest, DeferGcForAWhile, Heap, HeapConfig, PropertyStorage, Strong, Trace,
};
use std::hint::black_box;

#[derive(Trace, Cell)]
struct Object {
    properties: PropertyStorage,
}

fn build_tree(heap: &Heap, depth: usize, fanout: usize) -> gengc::CellRef<Object> {
    let node = heap.allocate(Object {
        properties: PropertyStorage::new(if depth == 0 { 0 } else { fanout }),
    });
    if depth > 0 {
        for i in 0..fanout {
            let child = build_tree(heap, depth - 1, fanout);
            // SAFETY: collection is deferred while the tree is built.
            unsafe { node.get() }.properties.set(heap, node, i, child);
        }
    }
    node
}

fn tree(heap: &Heap, depth: usize, fanout: usize) -> Strong<Object> {
    let _defer = DeferGcForAWhile::new(heap);
    Strong::new(heap, build_tree(heap, depth, fanout))
}

fn bench_full_mark_by_markers(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_mark_wide_tree");
    group.sample_size(20);
    for markers in [1, 2, 4, 8] {
        let heap = Heap::new(HeapConfig::default().with_number_of_markers(markers));
        let _root = tree(&heap, 4, 16);
        group.bench_with_input(BenchmarkId::from_parameter(markers), &markers, |b, _| {
            b.iter(|| black_box(heap.collect(CollectionRequest::Full)));
        });
    }
    group.finish();
}

fn bench_deep_chain_by_markers(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_mark_deep_tree");
    group.sample_size(20);
    for markers in [1, 4] {
        let heap = Heap::new(HeapConfig::default().with_number_of_markers(markers));
        let _root = tree(&heap, 16, 2);
        group.bench_with_input(BenchmarkId::from_parameter(markers), &markers, |b, _| {
            b.iter(|| black_box(heap.collect(CollectionRequest::Full)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_mark_by_markers, bench_deep_chain_by_markers);
criterion_main!(benches);
