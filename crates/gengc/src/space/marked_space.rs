//! The object space: size-classed cell allocation and sweeping.
//!
//! Cells up to [`MAX_SMALL_CELL_SIZE`](super::block::MAX_SMALL_CELL_SIZE) are carved out of shared blocks, one
//! [`MarkedAllocator`] per size class. Anything larger gets a dedicated
//! multi-block region holding exactly one cell.
//!
//! Sweeping is lazy. A collection hands the [`IncrementalSweeper`] a snapshot
//! of the blocks whose marks changed; allocation sweeps blocks on demand as it
//! walks them, and whatever is left is finished before the next marking.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cell::CellPtr;
use crate::heap::CollectionKind;

use super::block::{
    large_allocation_size, BlockId, MarkedBlock, SweepMode, BLOCK_SIZE, CELL_ALIGNMENT,
};
use super::block_allocator::{BlockAllocator, BlockSet};

/// Cell sizes served from shared blocks.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Index of the smallest size class holding `size` bytes.
#[must_use]
pub fn size_class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| size <= class)
}

// ============================================================================
// MarkedAllocator
// ============================================================================

/// Free-list allocator for one size class.
#[derive(Debug)]
pub struct MarkedAllocator {
    cell_size: usize,
    blocks: Vec<MarkedBlock>,
    /// Next block to sweep into the free list this cycle.
    cursor: usize,
    free_list: Vec<usize>,
}

impl MarkedAllocator {
    const fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            blocks: Vec::new(),
            cursor: 0,
            free_list: Vec::new(),
        }
    }

    /// Pops a free cell, sweeping blocks from the cursor until one has room.
    fn try_allocate(&mut self, zombie: bool) -> Option<usize> {
        loop {
            if let Some(addr) = self.free_list.pop() {
                return Some(addr);
            }
            let block = *self.blocks.get(self.cursor)?;
            self.cursor += 1;
            let mut swept = block.sweep(SweepMode::SweepToFreeList, zombie);
            if !swept.free_cells.is_empty() {
                swept.free_cells.reverse();
                self.free_list = swept.free_cells;
                block.set_new_space(true);
            }
        }
    }

    fn add_block(&mut self, block: MarkedBlock) {
        self.blocks.push(block);
    }

    fn stop_allocating(&mut self) {
        self.free_list.clear();
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.free_list.clear();
    }

    /// Cell size served.
    #[must_use]
    pub const fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Blocks owned.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

// ============================================================================
// IncrementalSweeper
// ============================================================================

/// Sweeps a block snapshot a block at a time.
#[derive(Debug, Default)]
pub struct IncrementalSweeper {
    pending: Vec<MarkedBlock>,
}

impl IncrementalSweeper {
    fn start_sweeping(&mut self, blocks: Vec<MarkedBlock>) {
        self.pending = blocks;
    }

    /// Sweeps one pending block. Returns `false` once nothing is left.
    fn sweep_next_block(&mut self, zombie: bool) -> bool {
        while let Some(block) = self.pending.pop() {
            if block.needs_sweep() {
                block.sweep(SweepMode::SweepOnly, zombie);
                return true;
            }
        }
        false
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// CellIndex
// ============================================================================

/// The blocks of a [`MarkedSpace`], readable without locking the space.
///
/// A block leaves the index before its memory is released, so a block
/// resolved under the read lock stays mapped until the lock is dropped.
#[derive(Debug, Default)]
pub struct CellIndex {
    blocks: RwLock<BlockSet>,
}

impl CellIndex {
    /// Resolves `addr` to an allocated cell and runs `f` on it under the
    /// read lock.
    ///
    /// Never dereferences `addr` unless it lies in a known block; only the
    /// exact start of an allocated cell is accepted.
    pub fn with_cell<R>(&self, addr: usize, f: impl FnOnce(MarkedBlock, usize) -> R) -> Option<R> {
        let blocks = self.blocks.read();
        let base = MarkedBlock::base_of(addr);
        if !blocks.contains(base) {
            return None;
        }
        // SAFETY: `base` is a member of the block set, which we hold.
        let block = unsafe { MarkedBlock::from_base(base) };
        let index = block.cell_index(addr)?;
        block.is_allocated(index).then(|| f(block, index))
    }

    /// Resolves a candidate pointer to an allocated cell.
    ///
    /// The block may be released once this returns; callers hold off
    /// sweeping and shrinking while they use it.
    #[must_use]
    pub fn cell_for_candidate(&self, addr: usize) -> Option<(MarkedBlock, usize)> {
        self.with_cell(addr, |block, index| (block, index))
    }

    /// Whether `addr` lies in a known block.
    #[must_use]
    pub fn contains_block(&self, addr: usize) -> bool {
        self.blocks.read().contains(MarkedBlock::base_of(addr))
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether no block is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

// ============================================================================
// MarkedSpace
// ============================================================================

/// Owns every block holding cells.
pub struct MarkedSpace {
    block_allocator: BlockAllocator,
    /// Arena of live blocks indexed by [`BlockId`].
    blocks: Vec<Option<MarkedBlock>>,
    free_ids: Vec<u32>,
    cells: Arc<CellIndex>,
    allocators: [MarkedAllocator; SIZE_CLASSES.len()],
    large: Vec<MarkedBlock>,
    sweeper: IncrementalSweeper,
    zombie_mode: bool,
}

impl MarkedSpace {
    /// An empty space.
    #[must_use]
    pub fn new(zombie_mode: bool) -> Self {
        Self {
            block_allocator: BlockAllocator::new(BLOCK_SIZE),
            blocks: Vec::new(),
            free_ids: Vec::new(),
            cells: Arc::new(CellIndex {
                blocks: RwLock::new(BlockSet::new()),
            }),
            allocators: SIZE_CLASSES.map(MarkedAllocator::new),
            large: Vec::new(),
            sweeper: IncrementalSweeper::default(),
            zombie_mode,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn next_block_id(&mut self) -> BlockId {
        match self.free_ids.pop() {
            Some(id) => BlockId(id),
            None => {
                self.blocks.push(None);
                BlockId((self.blocks.len() - 1) as u32)
            }
        }
    }

    fn register(&mut self, block: MarkedBlock) {
        self.blocks[block.id().index()] = Some(block);
        self.cells.blocks.write().add(block.base(), block.alloc_size());
    }

    fn unregister(&mut self, block: MarkedBlock) {
        self.blocks[block.id().index()] = None;
        self.free_ids.push(block.id().0);
        self.cells.blocks.write().remove(block.base());
    }

    /// The index of this space's blocks.
    #[must_use]
    pub const fn cells(&self) -> &Arc<CellIndex> {
        &self.cells
    }

    /// Looks up a block by id.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<MarkedBlock> {
        self.blocks.get(id.index()).copied().flatten()
    }

    /// Allocates an uninitialized cell of at least `size` bytes.
    ///
    /// Returns the cell address and the bytes it occupies. The cell is already
    /// recorded as allocated and newly allocated.
    pub fn allocate(&mut self, size: usize) -> (NonNull<u8>, usize) {
        let Some(class) = size_class_index(size) else {
            return self.allocate_large(size);
        };
        let zombie = self.zombie_mode;
        let addr = match self.allocators[class].try_allocate(zombie) {
            Some(addr) => addr,
            None => {
                let block = self.allocate_block(SIZE_CLASSES[class], BLOCK_SIZE);
                self.allocators[class].add_block(block);
                match self.allocators[class].try_allocate(zombie) {
                    Some(addr) => addr,
                    None => unreachable!("fresh block has no free cells"),
                }
            }
        };
        // SAFETY: free-list addresses are cells of live blocks.
        let (block, index) = unsafe { MarkedBlock::of(CellPtr::from_addr(addr).unwrap_unchecked()) };
        block.did_allocate(index);
        // SAFETY: block addresses are never null.
        (unsafe { NonNull::new_unchecked(addr as *mut u8) }, SIZE_CLASSES[class])
    }

    fn allocate_block(&mut self, cell_size: usize, alloc_size: usize) -> MarkedBlock {
        let memory = if alloc_size == BLOCK_SIZE {
            self.block_allocator.allocate()
        } else {
            self.block_allocator.allocate_sized(alloc_size)
        };
        let id = self.next_block_id();
        // SAFETY: the allocator hands out aligned regions of `alloc_size` bytes.
        let block = unsafe { MarkedBlock::initialize(memory, id, cell_size, alloc_size) };
        self.register(block);
        block
    }

    fn allocate_large(&mut self, size: usize) -> (NonNull<u8>, usize) {
        let cell_size = size.next_multiple_of(CELL_ALIGNMENT);
        let block = self.allocate_block(cell_size, large_allocation_size(cell_size));
        block.set_new_space(true);
        block.did_allocate(0);
        self.large.push(block);
        let cell = block.cell_at(0);
        // SAFETY: cells are never null.
        (unsafe { NonNull::new_unchecked(cell.as_ptr().cast()) }, cell_size)
    }

    // ------------------------------------------------------------------------
    // Collection protocol
    // ------------------------------------------------------------------------

    /// Freezes allocation so marking sees a consistent heap.
    ///
    /// Finishes every pending sweep: a dead but unswept cell must not be
    /// revived by a conservative root.
    pub fn stop_allocating(&mut self) {
        for allocator in &mut self.allocators {
            allocator.stop_allocating();
        }
        self.sweep_all();
    }

    /// Clears marks before a fresh mark pass.
    ///
    /// A full collection forgets every mark. An eden collection keeps old
    /// marks and clears only those of cells allocated in new-space blocks.
    pub fn clear_marks(&self, kind: CollectionKind) {
        match kind {
            CollectionKind::Full => self.for_each_block(|block| block.clear_marks()),
            CollectionKind::Eden => self.for_each_block(|block| {
                if block.is_new_space() {
                    block.clear_newly_allocated_marks();
                }
            }),
        }
    }

    /// Promotes every cell allocated since the previous collection.
    pub fn clear_newly_allocated(&self) {
        self.for_each_block(|block| block.clear_newly_allocated());
    }

    /// Every allocated cell, for the immortal-objects debug mode.
    #[must_use]
    pub fn allocated_cells(&self) -> Vec<CellPtr> {
        let mut cells = Vec::new();
        self.for_each_block(|block| block.for_each_allocated_cell(|cell| cells.push(cell)));
        cells
    }

    /// Hands the sweeper the blocks whose marks this collection decided.
    ///
    /// Large regions are swept right away; a dead one is released.
    pub fn snapshot(&mut self, kind: CollectionKind) {
        let mut snapshot = Vec::new();
        for allocator in &self.allocators {
            for &block in &allocator.blocks {
                if kind == CollectionKind::Full || block.is_new_space() {
                    block.set_needs_sweep(true);
                    snapshot.push(block);
                }
                block.set_new_space(false);
            }
        }
        self.sweeper.start_sweeping(snapshot);
        self.sweep_large(kind);
    }

    fn sweep_large(&mut self, kind: CollectionKind) {
        let zombie = self.zombie_mode;
        let mut dead = Vec::new();
        self.large.retain(|&block| {
            if kind == CollectionKind::Eden && !block.is_new_space() {
                return true;
            }
            block.set_new_space(false);
            let swept = block.sweep(SweepMode::SweepOnly, zombie);
            if swept.live == 0 {
                dead.push(block);
                false
            } else {
                true
            }
        });
        for block in dead {
            self.release_block(block);
        }
    }

    fn release_block(&mut self, block: MarkedBlock) {
        self.unregister(block);
        if block.alloc_size() == BLOCK_SIZE {
            // SAFETY: the block is unregistered and holds no cells.
            unsafe { self.block_allocator.deallocate(block.memory()) };
        } else {
            // SAFETY: as above; large regions go back to the system.
            unsafe { self.block_allocator.release(block.memory(), block.alloc_size()) };
        }
    }

    /// Re-opens allocation after a collection.
    pub fn reset_allocators(&mut self) {
        for allocator in &mut self.allocators {
            allocator.reset();
        }
    }

    /// Sweeps one pending block. Returns `false` once nothing is left.
    pub fn sweep_next_block(&mut self) -> bool {
        self.sweeper.sweep_next_block(self.zombie_mode)
    }

    /// Whether the sweeper finished its snapshot.
    #[must_use]
    pub fn is_sweeping_done(&self) -> bool {
        self.sweeper.is_done()
    }

    /// Finishes every pending sweep.
    pub fn sweep_all(&mut self) {
        while self.sweep_next_block() {}
    }

    /// Returns empty blocks to the block allocator and the pool to the system.
    ///
    /// Returns the number of blocks freed.
    pub fn shrink(&mut self) -> usize {
        self.stop_allocating();
        let mut empty = Vec::new();
        for allocator in &mut self.allocators {
            allocator.blocks.retain(|&block| {
                if block.allocated_count() == 0 {
                    empty.push(block);
                    false
                } else {
                    true
                }
            });
            allocator.reset();
        }
        let freed = empty.len();
        for block in empty {
            self.release_block(block);
        }
        self.block_allocator.release_free_blocks();
        let blocks = &self.blocks;
        self.cells.blocks.write().rebuild(|base| {
            blocks
                .iter()
                .flatten()
                .find(|block| block.base() == base)
                .map_or(BLOCK_SIZE, MarkedBlock::alloc_size)
        });
        freed
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Resolves a candidate pointer to an allocated cell.
    ///
    /// Never dereferences `addr` unless it lies in a known block; only the
    /// exact start of an allocated cell is accepted.
    #[must_use]
    pub fn cell_for_candidate(&self, addr: usize) -> Option<(MarkedBlock, usize)> {
        self.cells.cell_for_candidate(addr)
    }

    /// Resolves `addr` to a live cell: allocated, and marked or allocated
    /// since the last collection.
    #[must_use]
    pub fn live_cell(&self, addr: usize) -> Option<(MarkedBlock, usize)> {
        self.cell_for_candidate(addr)
            .filter(|&(block, index)| block.is_live(index))
    }

    /// Whether `addr` lies in a block of this space.
    #[must_use]
    pub fn contains_block(&self, addr: usize) -> bool {
        self.cells.contains_block(addr)
    }

    /// Calls `f` for every block.
    pub fn for_each_block(&self, mut f: impl FnMut(MarkedBlock)) {
        for block in self.blocks.iter().flatten() {
            f(*block);
        }
    }

    /// Calls `f` for every live cell.
    pub fn for_each_live_cell(&self, mut f: impl FnMut(CellPtr)) {
        self.for_each_block(|block| block.for_each_live_cell(&mut f));
    }

    /// Calls `f` for every dead cell not yet swept.
    pub fn for_each_dead_cell(&self, mut f: impl FnMut(CellPtr)) {
        self.for_each_block(|block| block.for_each_dead_cell(&mut f));
    }

    /// Number of live cells.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        self.for_each_block(|block| count += block.live_count());
        count
    }

    /// Bytes held by live cells.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut size = 0;
        self.for_each_block(|block| size += block.live_count() * block.cell_size());
        size
    }

    /// Bytes of block memory in use.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let mut capacity = 0;
        self.for_each_block(|block| capacity += block.alloc_size());
        capacity
    }

    /// Bytes obtained from the system, pooled blocks included.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.block_allocator.committed_bytes()
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.cells.len()
    }

    /// Runs every remaining destructor. Used when the heap is torn down.
    pub fn destroy_all_cells(&mut self) {
        self.sweeper.start_sweeping(Vec::new());
        self.for_each_block(|block| block.destroy_all());
    }
}

impl Drop for MarkedSpace {
    fn drop(&mut self) {
        let blocks: Vec<_> = self.blocks.iter().flatten().copied().collect();
        for block in blocks {
            // SAFETY: the space is going away; nothing references its cells.
            unsafe { self.block_allocator.release(block.memory(), block.alloc_size()) };
        }
    }
}

impl std::fmt::Debug for MarkedSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkedSpace")
            .field("blocks", &self.block_count())
            .field("large", &self.large.len())
            .field("committed", &self.committed_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{class_info, CellHeader};

    struct Small;

    // SAFETY: holds no references.
    unsafe impl crate::Trace for Small {
        fn trace(&self, _visitor: &mut crate::SlotVisitor<'_>) {}
    }

    // SAFETY: holds no references.
    unsafe impl crate::Cell for Small {
        const IS_COMPOUND: bool = false;
    }

    fn allocate(space: &mut MarkedSpace, size: usize) -> CellPtr {
        let (ptr, _) = space.allocate(size);
        let cell = CellPtr::from_addr(ptr.as_ptr() as usize).unwrap();
        unsafe { cell.as_ptr().write(CellHeader::new(class_info::<Small>())) };
        cell
    }

    fn collect(space: &mut MarkedSpace, kind: CollectionKind, live: &[CellPtr]) {
        space.stop_allocating();
        space.clear_marks(kind);
        for &cell in live {
            let (block, index) = unsafe { MarkedBlock::of(cell) };
            block.test_and_set_marked(index);
        }
        space.clear_newly_allocated();
        space.snapshot(kind);
        space.reset_allocators();
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class_index(1), Some(0));
        assert_eq!(size_class_index(16), Some(0));
        assert_eq!(size_class_index(17), Some(1));
        assert_eq!(size_class_index(2048), Some(7));
        assert_eq!(size_class_index(2049), None);
    }

    #[test]
    fn test_allocation_fills_blocks() {
        let mut space = MarkedSpace::new(false);
        let a = allocate(&mut space, 24);
        let b = allocate(&mut space, 24);
        assert_ne!(a, b);
        assert_eq!(MarkedBlock::base_of(a.addr()), MarkedBlock::base_of(b.addr()));
        assert_eq!(space.object_count(), 2);
        assert_eq!(space.size(), 64);
        assert_eq!(space.capacity(), BLOCK_SIZE);
        assert!(space.cell_for_candidate(a.addr()).is_some());
        assert!(space.cell_for_candidate(a.addr() + 8).is_none());
        assert!(space.cells().contains_block(a.addr()));
    }

    #[test]
    fn test_full_collection_sweeps_unmarked() {
        let mut space = MarkedSpace::new(false);
        let cells: Vec<_> = (0..10).map(|_| allocate(&mut space, 16)).collect();
        collect(&mut space, CollectionKind::Full, &cells[..3]);
        space.sweep_all();
        assert_eq!(space.object_count(), 3);
        assert!(space.cell_for_candidate(cells[5].addr()).is_none());
    }

    #[test]
    fn test_eden_collection_keeps_old_cells() {
        let mut space = MarkedSpace::new(false);
        let old = allocate(&mut space, 16);
        collect(&mut space, CollectionKind::Full, &[old]);
        space.sweep_all();

        let young = allocate(&mut space, 16);
        collect(&mut space, CollectionKind::Eden, &[]);
        space.sweep_all();
        assert!(space.cell_for_candidate(old.addr()).is_some());
        assert!(space.cell_for_candidate(young.addr()).is_none());
    }

    #[test]
    fn test_live_cell_rejects_dead_and_foreign_addresses() {
        let mut space = MarkedSpace::new(false);
        let kept = allocate(&mut space, 16);
        let dropped = allocate(&mut space, 16);
        assert!(space.live_cell(dropped.addr()).is_some());

        collect(&mut space, CollectionKind::Full, &[kept]);
        assert!(space.live_cell(kept.addr()).is_some());
        assert!(space.live_cell(dropped.addr()).is_none());

        let outside = Box::new([0u64; 4]);
        let addr = std::ptr::from_ref(&*outside) as usize;
        assert!(space.live_cell(addr).is_none());
        assert!(space.cells().with_cell(addr, |_, _| ()).is_none());
    }

    #[test]
    fn test_large_cells_get_their_own_region() {
        let mut space = MarkedSpace::new(false);
        let big = allocate(&mut space, 10_000);
        let (block, index) = unsafe { MarkedBlock::of(big) };
        assert!(block.is_large());
        assert_eq!(index, 0);
        assert_eq!(space.size(), 10_000usize.next_multiple_of(CELL_ALIGNMENT));

        collect(&mut space, CollectionKind::Full, &[]);
        assert_eq!(space.block_count(), 0);
        assert_eq!(space.committed_bytes(), 0);
    }

    #[test]
    fn test_shrink_is_idempotent() {
        let mut space = MarkedSpace::new(false);
        for _ in 0..2000 {
            allocate(&mut space, 32);
        }
        collect(&mut space, CollectionKind::Full, &[]);
        let freed = space.shrink();
        assert!(freed > 0);
        let size = space.size();
        assert_eq!(space.shrink(), 0);
        assert_eq!(space.size(), size);
        assert_eq!(space.block_count(), 0);
    }

    #[test]
    fn test_lazy_sweep_progresses_block_by_block() {
        let mut space = MarkedSpace::new(false);
        for _ in 0..1500 {
            allocate(&mut space, 16);
        }
        collect(&mut space, CollectionKind::Full, &[]);
        assert!(!space.is_sweeping_done());
        assert!(space.sweep_next_block());
        space.sweep_all();
        assert!(space.is_sweeping_done());
        assert!(!space.sweep_next_block());
        assert_eq!(space.object_count(), 0);
    }
}
