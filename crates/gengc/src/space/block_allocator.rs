//! Aligned block memory and the containment index over it.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

// ============================================================================
// BlockAllocator
// ============================================================================

/// Hands out aligned, fixed-size regions and keeps freed ones for reuse.
///
/// Multiple allocation paths and sweeping can return regions concurrently, so
/// the free pool is lock protected.
pub struct BlockAllocator {
    block_size: usize,
    free: Mutex<Vec<NonNull<u8>>>,
    committed: AtomicUsize,
}

// SAFETY: the pool only holds regions nobody else references.
unsafe impl Send for BlockAllocator {}
// SAFETY: see above; the pool is behind a mutex.
unsafe impl Sync for BlockAllocator {}

impl BlockAllocator {
    /// An allocator for regions of `block_size` bytes, aligned to `block_size`.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free: Mutex::new(Vec::new()),
            committed: AtomicUsize::new(0),
        }
    }

    fn layout(&self, size: usize) -> Layout {
        match Layout::from_size_align(size, self.block_size) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid block layout: {size} bytes"),
        }
    }

    /// Returns a region of exactly one block, reusing the free pool first.
    pub fn allocate(&self) -> NonNull<u8> {
        if let Some(block) = self.free.lock().pop() {
            return block;
        }
        self.allocate_sized(self.block_size)
    }

    /// Returns a fresh region of `size` bytes (a multiple of the block size).
    ///
    /// Oversized regions never enter the free pool.
    pub fn allocate_sized(&self, size: usize) -> NonNull<u8> {
        debug_assert_eq!(size % self.block_size, 0);
        let layout = self.layout(size);
        // SAFETY: the layout is non-zero sized.
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        self.committed.fetch_add(size, Ordering::Relaxed);
        ptr
    }

    /// Returns a single block to the free pool.
    ///
    /// # Safety
    ///
    /// `block` must come from [`allocate`](Self::allocate) and no longer be used.
    pub unsafe fn deallocate(&self, block: NonNull<u8>) {
        self.free.lock().push(block);
    }

    /// Releases a region of `size` bytes straight to the system.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with the same `size` and no longer
    /// be used.
    pub unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { dealloc(ptr.as_ptr(), self.layout(size)) };
        self.committed.fetch_sub(size, Ordering::Relaxed);
    }

    /// Releases every pooled block to the system.
    pub fn release_free_blocks(&self) -> usize {
        let blocks = std::mem::take(&mut *self.free.lock());
        let count = blocks.len();
        for block in blocks {
            // SAFETY: pooled blocks are unused and one block in size.
            unsafe { self.release(block, self.block_size) };
        }
        count
    }

    /// Number of blocks waiting in the free pool.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Bytes currently obtained from the system, pooled blocks included.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        self.release_free_blocks();
    }
}

// ============================================================================
// BlockSet
// ============================================================================

/// A one-word filter that rules out addresses cheaply.
///
/// Every member's bits are OR-ed into the filter; an address with a bit the
/// filter lacks cannot be a member.
#[derive(Debug, Clone, Copy, Default)]
pub struct TinyBloomFilter {
    bits: usize,
}

impl TinyBloomFilter {
    /// Adds `addr`.
    pub const fn add(&mut self, addr: usize) {
        self.bits |= addr;
    }

    /// Whether `addr` is certainly not a member.
    #[must_use]
    pub const fn rule_out(&self, addr: usize) -> bool {
        addr == 0 || addr & !self.bits != 0
    }

    /// Forgets every member.
    pub const fn reset(&mut self) {
        self.bits = 0;
    }
}

/// The set of block bases owned by a space.
///
/// Lookups go through an address range check and a bloom filter before the
/// hash set, since conservative scanning mostly queries non-pointers.
#[derive(Debug, Default)]
pub struct BlockSet {
    bases: HashSet<usize>,
    filter: TinyBloomFilter,
    min_addr: usize,
    max_addr: usize,
}

impl BlockSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bases: HashSet::new(),
            filter: TinyBloomFilter::default(),
            min_addr: usize::MAX,
            max_addr: 0,
        }
    }

    /// Adds the block at `base` spanning `size` bytes.
    pub fn add(&mut self, base: usize, size: usize) {
        self.bases.insert(base);
        self.filter.add(base);
        self.min_addr = self.min_addr.min(base);
        self.max_addr = self.max_addr.max(base + size);
    }

    /// Removes the block at `base`.
    ///
    /// The filter and range keep the stale bits until [`rebuild`](Self::rebuild).
    pub fn remove(&mut self, base: usize) {
        self.bases.remove(&base);
    }

    /// Recomputes the filter and range from the current members.
    pub fn rebuild(&mut self, size_of: impl Fn(usize) -> usize) {
        self.filter.reset();
        self.min_addr = usize::MAX;
        self.max_addr = 0;
        for &base in &self.bases {
            self.filter.add(base);
            self.min_addr = self.min_addr.min(base);
            self.max_addr = self.max_addr.max(base + size_of(base));
        }
    }

    /// Whether `base` is a member.
    #[must_use]
    pub fn contains(&self, base: usize) -> bool {
        if base < self.min_addr || base >= self.max_addr || self.filter.rule_out(base) {
            return false;
        }
        self.bases.contains(&base)
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::block::BLOCK_SIZE;

    #[test]
    fn test_allocate_is_aligned_and_pooled() {
        let allocator = BlockAllocator::new(BLOCK_SIZE);
        let a = allocator.allocate();
        assert_eq!(a.as_ptr() as usize % BLOCK_SIZE, 0);
        assert_eq!(allocator.committed_bytes(), BLOCK_SIZE);

        unsafe { allocator.deallocate(a) };
        assert_eq!(allocator.free_block_count(), 1);
        let b = allocator.allocate();
        assert_eq!(a, b);
        assert_eq!(allocator.committed_bytes(), BLOCK_SIZE);

        unsafe { allocator.deallocate(b) };
        assert_eq!(allocator.release_free_blocks(), 1);
        assert_eq!(allocator.committed_bytes(), 0);
    }

    #[test]
    fn test_sized_regions_are_released() {
        let allocator = BlockAllocator::new(BLOCK_SIZE);
        let big = allocator.allocate_sized(3 * BLOCK_SIZE);
        assert_eq!(allocator.committed_bytes(), 3 * BLOCK_SIZE);
        unsafe { allocator.release(big, 3 * BLOCK_SIZE) };
        assert_eq!(allocator.committed_bytes(), 0);
        assert_eq!(allocator.free_block_count(), 0);
    }

    #[test]
    fn test_bloom_filter_rules_out() {
        let mut filter = TinyBloomFilter::default();
        filter.add(0x4000);
        filter.add(0x8000);
        assert!(!filter.rule_out(0x4000));
        assert!(!filter.rule_out(0xc000));
        assert!(filter.rule_out(0x10000));
        assert!(filter.rule_out(0));
    }

    #[test]
    fn test_block_set_membership() {
        let mut set = BlockSet::new();
        assert!(!set.contains(0x4000));
        set.add(0x4000, BLOCK_SIZE);
        set.add(0xc000, BLOCK_SIZE);
        assert!(set.contains(0x4000));
        assert!(set.contains(0xc000));
        assert!(!set.contains(0x8000));
        assert_eq!(set.len(), 2);

        set.remove(0x4000);
        assert!(!set.contains(0x4000));
        set.rebuild(|_| BLOCK_SIZE);
        assert!(set.contains(0xc000));
        assert!(!set.is_empty());
    }
}
