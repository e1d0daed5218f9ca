//! Parallel marking: work balancing between mark stacks and agreement of
//! parallel and serial marking.

use std::collections::HashSet;
use std::sync::Arc;

use gengc::gc::mark_stack::SEGMENT_CAPACITY;
use gengc::gc::{MarkStackArray, SegmentAllocator};
use gengc::{
    Cell, CellPtr, CollectionRequest, DeferGcForAWhile, Heap, HeapConfig, PropertyStorage, Strong,
    Trace,
};

#[derive(Trace, Cell)]
struct Object {
    properties: PropertyStorage,
}

fn fake_cell(i: usize) -> CellPtr {
    CellPtr::from_addr((i + 1) * 16).expect("non-null address")
}

// ============================================================================
// Mark stack balancing
// ============================================================================

fn filled_stack(allocator: &Arc<SegmentAllocator>, cells: usize) -> MarkStackArray {
    let mut stack = MarkStackArray::new(Arc::clone(allocator));
    for i in 0..cells {
        stack.append(fake_cell(i));
    }
    stack
}

fn drain_all(stack: &mut MarkStackArray, into: &mut HashSet<usize>) {
    while stack.refill() {
        while let Some(cell) = stack.remove_last() {
            assert!(into.insert(cell.addr()), "cell handed out twice");
        }
    }
}

#[test]
fn test_donation_moves_whole_segments() {
    let allocator = Arc::new(SegmentAllocator::new());
    let total = SEGMENT_CAPACITY * 4 + 7;
    let mut donor = filled_stack(&allocator, total);
    let mut receiver = MarkStackArray::new(Arc::clone(&allocator));
    assert_eq!(donor.segment_count(), 5);

    donor.donate_some_cells_to(&mut receiver);
    assert_eq!(receiver.size(), 2 * SEGMENT_CAPACITY);
    assert_eq!(donor.size() + receiver.size(), total);

    let mut seen = HashSet::new();
    drain_all(&mut donor, &mut seen);
    drain_all(&mut receiver, &mut seen);
    assert_eq!(seen.len(), total);
}

#[test]
fn test_donation_splits_a_single_segment() {
    let allocator = Arc::new(SegmentAllocator::new());
    let mut donor = filled_stack(&allocator, 10);
    let mut receiver = MarkStackArray::new(Arc::clone(&allocator));

    donor.donate_some_cells_to(&mut receiver);
    assert_eq!(donor.size(), 5);
    assert_eq!(receiver.size(), 5);
}

#[test]
fn test_stealing_divides_work_among_idle_threads() {
    let allocator = Arc::new(SegmentAllocator::new());
    let mut shared = filled_stack(&allocator, 9);
    let mut thief = MarkStackArray::new(Arc::clone(&allocator));

    thief.steal_some_cells_from(&mut shared, 3);
    assert_eq!(thief.size(), 3);
    assert_eq!(shared.size(), 6);

    let mut big = filled_stack(&allocator, SEGMENT_CAPACITY * 2);
    let mut thief = MarkStackArray::new(Arc::clone(&allocator));
    thief.steal_some_cells_from(&mut big, 8);
    assert_eq!(thief.size(), SEGMENT_CAPACITY);
}

#[test]
fn test_balancing_across_threads_conserves_cells() {
    let allocator = Arc::new(SegmentAllocator::new());
    let total = SEGMENT_CAPACITY * 16;
    let shared = Arc::new(parking_lot::Mutex::new(filled_stack(&allocator, total)));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                let mut local = MarkStackArray::new(allocator);
                let mut seen = HashSet::new();
                loop {
                    {
                        let mut shared = shared.lock();
                        if shared.is_empty() {
                            break;
                        }
                        local.steal_some_cells_from(&mut shared, 4);
                    }
                    drain_all(&mut local, &mut seen);
                }
                seen
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(all.insert(addr), "cell processed by two threads");
        }
    }
    assert_eq!(all.len(), total);
    drop(shared);
    assert_eq!(allocator.free_count(), allocator.allocated_count());
}

// ============================================================================
// Parallel and serial marking agree
// ============================================================================

/// Builds a tree with `fanout` children per node, `depth` levels deep.
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

fn tree_size(depth: u32, fanout: usize) -> usize {
    (0..=depth).map(|level| fanout.pow(level)).sum()
}

fn visit_count_with_markers(markers: usize) -> usize {
    let heap = Heap::new(HeapConfig::default().with_number_of_markers(markers));
    let _wide = tree(&heap, 3, 20);
    let _deep = tree(&heap, 12, 2);
    heap.collect(CollectionRequest::Full);
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), tree_size(3, 20) + tree_size(12, 2));
    heap.last_gc_metrics().visit_count
}

#[test]
fn test_parallel_marking_matches_serial_marking() {
    let serial = visit_count_with_markers(1);
    let parallel = visit_count_with_markers(4);
    assert_eq!(serial, tree_size(3, 20) + tree_size(12, 2));
    assert_eq!(parallel, serial);
}

#[test]
fn test_parallel_eden_marking_matches_serial() {
    let counts: Vec<_> = [1, 4]
        .into_iter()
        .map(|markers| {
            let heap = Heap::new(HeapConfig::default().with_number_of_markers(markers));
            let _old = tree(&heap, 2, 30);
            heap.collect(CollectionRequest::Full);
            let _young = tree(&heap, 2, 30);
            heap.collect(CollectionRequest::Eden);
            heap.last_gc_metrics().visit_count
        })
        .collect();
    assert_eq!(counts[0], tree_size(2, 30));
    assert_eq!(counts[0], counts[1]);
}

// ============================================================================
// Allocation from many threads
// ============================================================================

#[test]
fn test_concurrent_allocation_with_triggered_collections() {
    let heap = Arc::new(Heap::new(HeapConfig::default().with_number_of_markers(2)));
    let root = tree(&heap, 3, 4);

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let heap = Arc::clone(&heap);
            std::thread::spawn(move || {
                for i in 0..20_000u64 {
                    heap.allocate(i ^ t);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(heap.statistics().total_collections() >= 1);
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), tree_size(3, 4));
    drop(root);
}

#[test]
fn test_collection_releases_every_ordered_lock() {
    let heap = Heap::new(HeapConfig::default().with_number_of_markers(4));
    let _root = tree(&heap, 4, 6);
    heap.collect(CollectionRequest::Full);
    heap.collect(CollectionRequest::Eden);
    assert_eq!(gengc::gc::sync::highest_held_level(), 0);
}
