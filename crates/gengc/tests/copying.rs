//! Backing stores in the copying space: evacuation, pinning and oversize
//! regions.

use gengc::{
    Cell, CollectionRequest, CopiedBuffer, Heap, HeapConfig, Strong, Trace,
};

#[derive(Trace, Cell)]
struct Blob {
    data: CopiedBuffer,
}

fn heap() -> Heap {
    Heap::new(HeapConfig::default().with_number_of_markers(1))
}

fn blob(heap: &Heap, len: usize, fill: u8) -> gengc::CellRef<Blob> {
    let cell = heap.allocate(Blob {
        data: CopiedBuffer::new(heap, len),
    });
    // SAFETY: no collection runs while filling.
    unsafe {
        cell.get().data.as_mut_slice().fill(fill);
    }
    cell
}

fn assert_filled(blob: &Blob, fill: u8) {
    // SAFETY: no collection runs while reading.
    let bytes = unsafe { blob.data.as_slice() };
    assert!(bytes.iter().all(|&b| b == fill), "buffer lost its contents");
}

#[test]
fn test_eden_evacuates_sparse_blocks_and_keeps_contents() {
    let heap = heap();
    let mut kept = Vec::new();
    for i in 0..400u32 {
        let cell = blob(&heap, 100, (i % 251) as u8);
        if i % 20 == 0 {
            kept.push((Strong::new(&heap, cell), (i % 251) as u8));
        }
    }
    let before: Vec<_> = kept.iter().map(|(b, _)| b.data.as_ptr()).collect();
    let blocks_before = heap.storage_block_count();

    heap.collect(CollectionRequest::Eden);
    let metrics = heap.last_gc_metrics();
    assert!(metrics.copied);
    assert!(metrics.bytes_copied > 0);
    assert!(heap.storage_block_count() < blocks_before);

    for ((blob, fill), old) in kept.iter().zip(before) {
        assert_ne!(blob.data.as_ptr(), old);
        assert_filled(blob, *fill);
    }
}

#[test]
fn test_full_collection_compacts_when_utilization_is_low() {
    let heap = heap();
    let mut kept = Vec::new();
    for i in 0..400u32 {
        let cell = blob(&heap, 100, 0x5a);
        if i % 50 == 0 {
            kept.push(Strong::new(&heap, cell));
        }
    }

    heap.collect(CollectionRequest::Full);
    assert!(heap.last_gc_metrics().copied);
    for blob in &kept {
        assert_filled(blob, 0x5a);
    }
}

#[test]
fn test_full_collection_skips_copy_when_not_profitable() {
    let heap = Heap::new(HeapConfig {
        min_heap_utilization: 0.0,
        ..HeapConfig::default().with_number_of_markers(1)
    });
    let kept: Vec<_> = (0..10)
        .map(|_| Strong::new(&heap, blob(&heap, 100, 1)))
        .collect();
    let before: Vec<_> = kept.iter().map(|b| b.data.as_ptr()).collect();

    heap.collect(CollectionRequest::Full);
    assert!(!heap.last_gc_metrics().copied);
    for (blob, old) in kept.iter().zip(before) {
        assert_eq!(blob.data.as_ptr(), old);
    }
}

#[test]
fn test_reallocated_store_of_old_owner_survives_eden() {
    let heap = heap();
    let owner = Strong::new(&heap, blob(&heap, 16, 7));
    heap.collect(CollectionRequest::Full);

    owner.data.reallocate(&heap, owner.cell(), 64);
    assert_eq!(owner.data.len(), 64);
    assert_eq!(heap.remembered_count(), 1);
    // Garbage in the same young block.
    for _ in 0..50 {
        blob(&heap, 64, 0);
    }

    heap.collect(CollectionRequest::Eden);
    // SAFETY: no collection runs while reading.
    let bytes = unsafe { owner.data.as_slice() };
    assert!(bytes[..16].iter().all(|&b| b == 7));
    assert!(bytes[16..].iter().all(|&b| b == 0));
}

#[test]
fn test_oversize_buffers_never_move_and_are_unmapped_when_dead() {
    let heap = heap();
    let big = Strong::new(&heap, blob(&heap, 64 * 1024, 3));
    blob(&heap, 64 * 1024, 4);
    let address = big.data.as_ptr();
    let regions = heap.storage_block_count();

    heap.collect(CollectionRequest::Full);
    assert_eq!(big.data.as_ptr(), address);
    assert_filled(&big, 3);
    assert!(heap.storage_block_count() < regions);

    drop(big);
    heap.collect_all_garbage();
    assert_eq!(heap.storage_block_count(), 0);
}

#[test]
fn test_empty_buffers_need_no_storage() {
    let heap = heap();
    let owner = Strong::new(&heap, blob(&heap, 0, 0));
    assert!(owner.data.is_empty());
    assert!(owner.data.as_ptr().is_null());
    heap.collect(CollectionRequest::Full);
    assert!(owner.data.is_empty());
}

#[test]
fn test_collect_all_garbage_releases_storage() {
    let heap = heap();
    for _ in 0..1000 {
        blob(&heap, 200, 0);
    }
    assert!(heap.storage_block_count() > 0);
    heap.collect_all_garbage();
    assert_eq!(heap.storage_block_count(), 0);
    assert_eq!(heap.object_count(), 0);
}
