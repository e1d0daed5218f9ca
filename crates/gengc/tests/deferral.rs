//! Deferral guards and collection protocol checks.

use gengc::{CollectionRequest, DeferGc, DeferGcForAWhile, Heap, HeapConfig, HeapOperation};

fn heap() -> Heap {
    Heap::new(HeapConfig::default().with_number_of_markers(1))
}

fn exhaust_eden_budget(heap: &Heap) {
    let budget = heap.limits().max_eden_size();
    while heap.limits().bytes_allocated_this_cycle() <= budget {
        heap.allocate(0u64);
    }
}

#[test]
fn test_allocation_does_not_collect_while_deferred() {
    let heap = heap();
    {
        let _defer = DeferGcForAWhile::new(&heap);
        exhaust_eden_budget(&heap);
        heap.allocate(1u64);
        heap.allocate(2u64);
        assert_eq!(heap.statistics().total_collections(), 0);
    }
    // The next allocation decides.
    heap.allocate(3u64);
    assert_eq!(heap.statistics().total_collections(), 1);
}

#[test]
fn test_defer_gc_collects_on_drop_when_needed() {
    let heap = heap();
    {
        let _defer = DeferGc::new(&heap);
        exhaust_eden_budget(&heap);
        assert_eq!(heap.statistics().total_collections(), 0);
    }
    assert_eq!(heap.statistics().total_collections(), 1);
    assert!(!heap.is_deferred());
}

#[test]
fn test_defer_gc_does_not_collect_without_need() {
    let heap = heap();
    {
        let _defer = DeferGc::new(&heap);
        heap.allocate(1u64);
    }
    assert_eq!(heap.statistics().total_collections(), 0);
}

#[test]
fn test_guards_nest() {
    let heap = heap();
    let outer = DeferGc::new(&heap);
    {
        let _inner = DeferGcForAWhile::new(&heap);
        assert!(heap.is_deferred());
    }
    assert!(heap.is_deferred());
    drop(outer);
    assert!(!heap.is_deferred());
}

#[test]
fn test_extra_memory_is_deferred_too() {
    let heap = heap();
    let defer = DeferGcForAWhile::new(&heap);
    heap.report_extra_memory_cost(heap.limits().max_eden_size() * 2);
    assert_eq!(heap.statistics().total_collections(), 0);
    drop(defer);
    heap.collect_if_necessary_or_defer();
    assert_eq!(heap.statistics().total_collections(), 1);
}

#[test]
#[should_panic(expected = "collect() while collection is deferred")]
fn test_explicit_collect_while_deferred_panics() {
    let heap = heap();
    let _defer = DeferGc::new(&heap);
    heap.collect(CollectionRequest::Full);
}

#[test]
fn test_operation_is_idle_outside_collections() {
    let heap = heap();
    assert_eq!(heap.operation(), HeapOperation::NoOperation);
    heap.collect(CollectionRequest::Eden);
    assert_eq!(heap.operation(), HeapOperation::NoOperation);
    assert!(!heap.is_busy());
}
