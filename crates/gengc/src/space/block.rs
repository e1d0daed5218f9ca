//! Marked blocks: fixed-size regions holding cells of one size class.
//!
//! A block is a `BLOCK_SIZE`-aligned region whose first bytes are a
//! [`BlockHeader`]. Because blocks are aligned, the block of any cell is found
//! by masking the cell address, and per-cell state (mark, allocated,
//! newly-allocated, remembered) lives in atomic bitmaps inside the header.
//!
//! ```text
//! +----------------+--------+--------+--------+-----+
//! | BlockHeader    | cell 0 | cell 1 | cell 2 | ... |
//! | magic, bitmaps |        |        |        |     |
//! +----------------+--------+--------+--------+-----+
//! ^ block base (aligned)
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::cell::{CellHeader, CellPtr};

/// Size and alignment of a block.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Mask that maps an interior address to its block base.
pub const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Alignment (and granularity) of every cell.
pub const CELL_ALIGNMENT: usize = 16;

const BITS_PER_WORD: usize = 64;
const MAX_CELLS_PER_BLOCK: usize = BLOCK_SIZE / CELL_ALIGNMENT;
const BITMAP_WORDS: usize = MAX_CELLS_PER_BLOCK / BITS_PER_WORD;

const BLOCK_MAGIC: u32 = 0x6765_6e67;

const NEW_SPACE: u8 = 1 << 0;
const NEEDS_SWEEP: u8 = 1 << 1;
const LARGE: u8 = 1 << 2;

/// Byte written over dead cells in zombie mode.
pub const ZOMBIE_BYTE: u8 = 0xdb;

/// Fixed-size atomic bitmap, one bit per cell.
pub struct AtomicBitmap {
    words: [AtomicU64; BITMAP_WORDS],
}

impl AtomicBitmap {
    /// An all-clear bitmap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; BITMAP_WORDS],
        }
    }

    const fn locate(index: usize) -> (usize, u64) {
        (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
    }

    /// Reads bit `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Sets bit `index`, returning whether it was already set.
    pub fn test_and_set(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears bit `index`, returning whether it was set.
    pub fn test_and_clear(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears every bit.
    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Whether no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }
}

impl Default for AtomicBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable identifier of a block inside its [`MarkedSpace`](super::MarkedSpace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Index into the block arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Metadata at the start of every block.
#[repr(C)]
pub struct BlockHeader {
    magic: u32,
    id: BlockId,
    cell_size: u32,
    cell_count: u32,
    first_cell_offset: u32,
    flags: AtomicU8,
    alloc_size: usize,
    marks: AtomicBitmap,
    allocated: AtomicBitmap,
    newly_allocated: AtomicBitmap,
    remembered: AtomicBitmap,
}

/// Offset of the first cell in every block.
pub const FIRST_CELL_OFFSET: usize =
    std::mem::size_of::<BlockHeader>().next_multiple_of(CELL_ALIGNMENT);

/// Largest cell that still shares a block with others.
pub const MAX_SMALL_CELL_SIZE: usize = 2048;

/// Bytes needed for a block holding one cell of `cell_size`.
#[must_use]
pub const fn large_allocation_size(cell_size: usize) -> usize {
    (FIRST_CELL_OFFSET + cell_size).next_multiple_of(BLOCK_SIZE)
}

/// Outcome of sweeping one block.
#[derive(Debug, Default)]
pub struct SweepResult {
    /// Addresses of free cells, when sweeping to a free list.
    pub free_cells: Vec<usize>,
    /// Cells destroyed by this sweep.
    pub freed: usize,
    /// Cells that survived.
    pub live: usize,
}

/// What to do with free cells found by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Destroy dead cells only.
    SweepOnly,
    /// Destroy dead cells and collect every free cell.
    SweepToFreeList,
}

/// A handle to an initialized block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkedBlock(NonNull<BlockHeader>);

// SAFETY: all shared block state is atomic; structural changes happen under
// the object space lock.
unsafe impl Send for MarkedBlock {}
// SAFETY: see above.
unsafe impl Sync for MarkedBlock {}

impl std::fmt::Debug for MarkedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkedBlock")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("id", &self.id())
            .field("cell_size", &self.cell_size())
            .finish()
    }
}

impl MarkedBlock {
    /// Writes a fresh header at `memory` and returns the block.
    ///
    /// # Safety
    ///
    /// `memory` must be `BLOCK_SIZE`-aligned, writable and `alloc_size` bytes
    /// long, and `alloc_size` must fit `cell_size` cells after the header.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn initialize(
        memory: NonNull<u8>,
        id: BlockId,
        cell_size: usize,
        alloc_size: usize,
    ) -> Self {
        debug_assert_eq!(memory.as_ptr() as usize & !BLOCK_MASK, 0);
        debug_assert_eq!(cell_size % CELL_ALIGNMENT, 0);
        let large = cell_size > MAX_SMALL_CELL_SIZE;
        let cell_count = if large {
            1
        } else {
            (BLOCK_SIZE - FIRST_CELL_OFFSET) / cell_size
        };
        let header = BlockHeader {
            magic: BLOCK_MAGIC,
            id,
            cell_size: cell_size as u32,
            cell_count: cell_count as u32,
            first_cell_offset: FIRST_CELL_OFFSET as u32,
            flags: AtomicU8::new(if large { LARGE } else { 0 }),
            alloc_size,
            marks: AtomicBitmap::new(),
            allocated: AtomicBitmap::new(),
            newly_allocated: AtomicBitmap::new(),
            remembered: AtomicBitmap::new(),
        };
        let ptr = memory.cast::<BlockHeader>();
        // SAFETY: guaranteed by the caller.
        unsafe { ptr.as_ptr().write(header) };
        Self(ptr)
    }

    /// Base address of the block containing `addr`.
    #[must_use]
    pub const fn base_of(addr: usize) -> usize {
        addr & BLOCK_MASK
    }

    /// Reinterprets a known block base.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live, initialized block.
    #[must_use]
    pub unsafe fn from_base(base: usize) -> Self {
        // SAFETY: guaranteed by the caller.
        let block = Self(unsafe { NonNull::new_unchecked(base as *mut BlockHeader) });
        debug_assert_eq!(block.header().magic, BLOCK_MAGIC);
        block
    }

    /// The block and cell index of a live cell.
    ///
    /// # Safety
    ///
    /// `cell` must be a cell allocated in a marked block.
    #[must_use]
    pub unsafe fn of(cell: CellPtr) -> (Self, usize) {
        // SAFETY: guaranteed by the caller.
        let block = unsafe { Self::from_base(Self::base_of(cell.addr())) };
        let index = (cell.addr() - block.base() - block.first_cell_offset()) / block.cell_size();
        (block, index)
    }

    fn header(&self) -> &BlockHeader {
        // SAFETY: a `MarkedBlock` always points at an initialized header.
        unsafe { self.0.as_ref() }
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn memory(&self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Arena identifier.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.header().id
    }

    /// Size of every cell in this block.
    #[must_use]
    pub fn cell_size(&self) -> usize {
        self.header().cell_size as usize
    }

    /// Number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.header().cell_count as usize
    }

    fn first_cell_offset(&self) -> usize {
        self.header().first_cell_offset as usize
    }

    /// Bytes of memory backing this block.
    #[must_use]
    pub fn alloc_size(&self) -> usize {
        self.header().alloc_size
    }

    /// Whether the block holds a single oversized cell.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & LARGE != 0
    }

    /// Cell `index`.
    #[must_use]
    pub fn cell_at(&self, index: usize) -> CellPtr {
        debug_assert!(index < self.cell_count());
        let addr = self.base() + self.first_cell_offset() + index * self.cell_size();
        // SAFETY: block bases are non-null, so no offset from one is null.
        unsafe { CellPtr::from_addr(addr).unwrap_unchecked() }
    }

    /// Index of the cell starting exactly at `addr`, if any.
    ///
    /// Interior pointers are rejected: only a cell's own address names it.
    #[must_use]
    pub fn cell_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base() + self.first_cell_offset())?;
        if offset % self.cell_size() != 0 {
            return None;
        }
        let index = offset / self.cell_size();
        (index < self.cell_count()).then_some(index)
    }

    /// Whether cell `index` is marked.
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        self.header().marks.get(index)
    }

    /// Marks cell `index`, returning whether it was already marked.
    pub fn test_and_set_marked(&self, index: usize) -> bool {
        self.header().marks.test_and_set(index)
    }

    /// Clears every mark.
    pub fn clear_marks(&self) {
        self.header().marks.clear_all();
    }

    /// Number of marked cells.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.header().marks.count()
    }

    /// Whether cell `index` holds an object.
    #[must_use]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.header().allocated.get(index)
    }

    /// Number of cells holding an object, dead or alive.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.header().allocated.count()
    }

    /// Records a fresh allocation in cell `index`.
    pub fn did_allocate(&self, index: usize) {
        let header = self.header();
        header.marks.test_and_clear(index);
        header.allocated.test_and_set(index);
        header.newly_allocated.test_and_set(index);
        header.remembered.test_and_clear(index);
    }

    /// Whether cell `index` was allocated since the last collection.
    #[must_use]
    pub fn is_newly_allocated(&self, index: usize) -> bool {
        self.header().newly_allocated.get(index)
    }

    /// Clears the marks of cells allocated since the last collection.
    pub fn clear_newly_allocated_marks(&self) {
        let header = self.header();
        for index in 0..self.cell_count() {
            if header.newly_allocated.get(index) {
                header.marks.test_and_clear(index);
            }
        }
    }

    /// Promotes every cell: none count as newly allocated any more.
    pub fn clear_newly_allocated(&self) {
        self.header().newly_allocated.clear_all();
    }

    /// Whether cell `index` is in the remembered set.
    #[must_use]
    pub fn is_remembered(&self, index: usize) -> bool {
        self.header().remembered.get(index)
    }

    /// Adds cell `index` to the remembered set, returning whether it was
    /// already there.
    pub fn test_and_set_remembered(&self, index: usize) -> bool {
        self.header().remembered.test_and_set(index)
    }

    /// Removes cell `index` from the remembered set.
    pub fn clear_remembered(&self, index: usize) {
        self.header().remembered.test_and_clear(index);
    }

    /// Empties the remembered set of this block.
    pub fn clear_all_remembered(&self) {
        self.header().remembered.clear_all();
    }

    /// Whether the block received allocations since the last collection.
    #[must_use]
    pub fn is_new_space(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & NEW_SPACE != 0
    }

    /// Flags the block as holding young cells.
    pub fn set_new_space(&self, new_space: bool) {
        self.set_flag(NEW_SPACE, new_space);
    }

    /// Whether marks are newer than the last sweep.
    #[must_use]
    pub fn needs_sweep(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & NEEDS_SWEEP != 0
    }

    /// Flags the block for sweeping.
    pub fn set_needs_sweep(&self, needs_sweep: bool) {
        self.set_flag(NEEDS_SWEEP, needs_sweep);
    }

    fn set_flag(&self, flag: u8, on: bool) {
        if on {
            self.header().flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.header().flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    /// Whether cell `index` is allocated and either marked or allocated
    /// since the last collection.
    #[must_use]
    pub fn is_live(&self, index: usize) -> bool {
        self.is_allocated(index) && (self.is_marked(index) || self.is_newly_allocated(index))
    }

    /// Whether no cell is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..self.cell_count()).all(|i| !self.is_live(i))
    }

    /// Number of cells that are alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        (0..self.cell_count()).filter(|&i| self.is_live(i)).count()
    }

    /// Destroys every dead cell, optionally collecting free cells.
    ///
    /// A cell is alive when it is marked or was allocated after the marks
    /// were computed. Dead cells have their destructor run exactly once and
    /// are zapped; in zombie mode their payload is poisoned.
    pub fn sweep(&self, mode: SweepMode, zombie: bool) -> SweepResult {
        let mut result = SweepResult::default();
        for index in 0..self.cell_count() {
            if self.is_live(index) {
                result.live += 1;
                continue;
            }
            if self.is_allocated(index) {
                let cell = self.cell_at(index);
                // SAFETY: the cell is allocated and unreachable; nothing will
                // observe it after this point.
                unsafe { cell.destroy() };
                if zombie {
                    self.zombify(cell);
                }
                let header = self.header();
                header.allocated.test_and_clear(index);
                header.marks.test_and_clear(index);
                header.remembered.test_and_clear(index);
                result.freed += 1;
            }
            if mode == SweepMode::SweepToFreeList {
                result.free_cells.push(self.cell_at(index).addr());
            }
        }
        self.set_needs_sweep(false);
        result
    }

    fn zombify(&self, cell: CellPtr) {
        let header_size = std::mem::size_of::<CellHeader>();
        let payload = self.cell_size() - header_size;
        // SAFETY: the payload lies inside this cell and the value was dropped.
        unsafe {
            std::ptr::write_bytes(
                cell.as_ptr().cast::<u8>().add(header_size),
                ZOMBIE_BYTE,
                payload,
            );
        }
    }

    /// Calls `f` for every allocated cell, live or not.
    pub fn for_each_allocated_cell(&self, mut f: impl FnMut(CellPtr)) {
        for index in 0..self.cell_count() {
            if self.is_allocated(index) {
                f(self.cell_at(index));
            }
        }
    }

    /// Calls `f` for every live cell.
    pub fn for_each_live_cell(&self, mut f: impl FnMut(CellPtr)) {
        for index in 0..self.cell_count() {
            if self.is_live(index) {
                f(self.cell_at(index));
            }
        }
    }

    /// Calls `f` for every allocated cell that is dead but not yet swept.
    pub fn for_each_dead_cell(&self, mut f: impl FnMut(CellPtr)) {
        for index in 0..self.cell_count() {
            if self.is_allocated(index) && !self.is_live(index) {
                f(self.cell_at(index));
            }
        }
    }

    /// Destroys every allocated cell regardless of liveness.
    pub fn destroy_all(&self) {
        for index in 0..self.cell_count() {
            if self.is_allocated(index) {
                // SAFETY: the heap is being torn down; no cell is reachable.
                unsafe { self.cell_at(index).destroy() };
                self.header().allocated.test_and_clear(index);
            }
        }
        self.clear_newly_allocated();
        self.clear_marks();
        self.clear_all_remembered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct TestBlock {
        block: MarkedBlock,
        layout: Layout,
    }

    impl TestBlock {
        fn new(cell_size: usize) -> Self {
            let alloc_size = if cell_size > MAX_SMALL_CELL_SIZE {
                large_allocation_size(cell_size)
            } else {
                BLOCK_SIZE
            };
            let layout = Layout::from_size_align(alloc_size, BLOCK_SIZE).unwrap();
            let memory = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            let block = unsafe { MarkedBlock::initialize(memory, BlockId(0), cell_size, alloc_size) };
            Self { block, layout }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            unsafe { dealloc(self.block.memory().as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_bitmap_test_and_set() {
        let bitmap = AtomicBitmap::new();
        assert!(!bitmap.test_and_set(70));
        assert!(bitmap.test_and_set(70));
        assert!(bitmap.get(70));
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.test_and_clear(70));
        assert!(!bitmap.test_and_clear(70));
        assert!(bitmap.is_empty());
    }

    #[test]
    fn test_block_geometry() {
        let t = TestBlock::new(32);
        assert_eq!(t.block.cell_size(), 32);
        assert_eq!(t.block.cell_count(), (BLOCK_SIZE - FIRST_CELL_OFFSET) / 32);
        assert!(!t.block.is_large());
        let last = t.block.cell_at(t.block.cell_count() - 1);
        assert!(last.addr() + 32 <= t.block.base() + BLOCK_SIZE);
        assert_eq!(MarkedBlock::base_of(last.addr()), t.block.base());
    }

    #[test]
    fn test_cell_index_rejects_interior_pointers() {
        let t = TestBlock::new(64);
        let cell = t.block.cell_at(3);
        assert_eq!(t.block.cell_index(cell.addr()), Some(3));
        assert_eq!(t.block.cell_index(cell.addr() + 8), None);
        assert_eq!(t.block.cell_index(t.block.base()), None);
        assert_eq!(t.block.cell_index(t.block.base() + BLOCK_SIZE), None);
    }

    #[test]
    fn test_large_block_has_one_cell() {
        let t = TestBlock::new(8192);
        assert!(t.block.is_large());
        assert_eq!(t.block.cell_count(), 1);
        assert_eq!(t.block.alloc_size(), large_allocation_size(8192));
    }

    #[test]
    fn test_sweep_collects_unmarked_cells() {
        let t = TestBlock::new(32);
        for i in 0..4 {
            let cell = t.block.cell_at(i);
            unsafe {
                cell.as_ptr()
                    .write(CellHeader::new(crate::cell::class_info::<Word>()));
            }
            t.block.did_allocate(i);
        }
        t.block.clear_newly_allocated();
        t.block.test_and_set_marked(1);
        t.block.test_and_set_marked(3);
        t.block.set_needs_sweep(true);

        let result = t.block.sweep(SweepMode::SweepToFreeList, true);
        assert_eq!(result.freed, 2);
        assert_eq!(result.live, 2);
        assert_eq!(result.free_cells.len(), t.block.cell_count() - 2);
        assert!(!t.block.is_allocated(0));
        assert!(t.block.is_allocated(1));
        assert!(!t.block.needs_sweep());
        assert!(unsafe { t.block.cell_at(0).header() }.is_zapped());

        let again = t.block.sweep(SweepMode::SweepOnly, false);
        assert_eq!(again.freed, 0);
        assert_eq!(again.live, 2);
    }

    #[test]
    fn test_newly_allocated_cells_survive_sweep() {
        let t = TestBlock::new(32);
        let cell = t.block.cell_at(0);
        unsafe {
            cell.as_ptr()
                .write(CellHeader::new(crate::cell::class_info::<Word>()));
        }
        t.block.did_allocate(0);
        let result = t.block.sweep(SweepMode::SweepOnly, false);
        assert_eq!(result.live, 1);
        assert_eq!(t.block.live_count(), 1);
        assert!(!t.block.is_empty());
    }

    struct Word(#[allow(dead_code)] u64);

    // SAFETY: holds no references.
    unsafe impl crate::Trace for Word {
        fn trace(&self, _visitor: &mut crate::SlotVisitor<'_>) {}
    }

    // SAFETY: holds no references.
    unsafe impl crate::Cell for Word {
        const IS_COMPOUND: bool = false;
    }
}
