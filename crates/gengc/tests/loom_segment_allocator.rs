//! Loom tests for the mark-stack segment allocator.
//!
//! Markers allocate and release segments concurrently while balancing work;
//! every segment must come back to the pool exactly once.

use std::sync::Arc;

use gengc::gc::mark_stack::SEGMENT_CAPACITY;
use gengc::gc::{MarkStackArray, SegmentAllocator};
use gengc::CellPtr;

fn cell(i: usize) -> CellPtr {
    CellPtr::from_addr((i + 1) * 16).unwrap()
}

/// Two markers releasing segments never lose one.
#[test]
#[ignore = "loom test - run with cargo test loom_segment_release --release"]
fn test_concurrent_release_keeps_every_segment() {
    loom::model(|| {
        let allocator = Arc::new(SegmentAllocator::new());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                loom::thread::spawn(move || {
                    let segment = allocator.allocate();
                    loom::thread::yield_now();
                    allocator.release(segment);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allocator.free_count(), allocator.allocated_count());
    });
}

/// A released segment is reused instead of allocating a new one.
#[test]
#[ignore = "loom test - run with cargo test loom_segment_reuse --release"]
fn test_release_then_allocate_reuses() {
    loom::model(|| {
        let allocator = Arc::new(SegmentAllocator::new());
        let segment = allocator.allocate();
        assert_eq!(allocator.allocated_count(), 1);

        let releaser = loom::thread::spawn({
            let allocator = Arc::clone(&allocator);
            move || allocator.release(segment)
        });
        releaser.join().unwrap();

        let again = allocator.allocate();
        assert_eq!(allocator.allocated_count(), 1);
        assert!(again.capacity() >= SEGMENT_CAPACITY);
        allocator.release(again);
    });
}

/// Stacks on two threads sharing one allocator return all segments on drop.
#[test]
#[ignore = "loom test - run with cargo test loom_segment_stacks --release"]
fn test_stacks_on_two_threads_return_segments() {
    loom::model(|| {
        let allocator = Arc::new(SegmentAllocator::new());

        let handles: Vec<_> = (0..2)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                loom::thread::spawn(move || {
                    let mut stack = MarkStackArray::new(allocator);
                    for i in 0..=SEGMENT_CAPACITY {
                        stack.append(cell(t * 10_000 + i));
                    }
                    assert_eq!(stack.segment_count(), 2);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allocator.free_count(), allocator.allocated_count());
        allocator.shrink();
        assert_eq!(allocator.allocated_count(), 0);
    });
}
