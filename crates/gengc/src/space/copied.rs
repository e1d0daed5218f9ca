//! The copying space for variable-length backing stores.
//!
//! Backing stores ([`CopiedBuffer`]) are bump-allocated out of aligned
//! [`CopiedBlock`]s. During marking every live owner reports its buffers with
//! [`SlotVisitor::copy_later`](crate::SlotVisitor::copy_later), which adds to
//! the block's live byte count and queues an `(owner, token)` work item.
//!
//! After marking the space decides whether compaction pays off. If it does,
//! [`CopyVisitor`]s evacuate sparsely used blocks in parallel, asking each
//! owner to relocate its buffers through
//! [`Cell::copy_backing_store`](crate::Cell::copy_backing_store). Pinned
//! blocks (targets of conservative roots) and dense blocks stay in place.
//!
//! Buffers larger than [`OVERSIZE_THRESHOLD`] get a private OS mapping and
//! never move; one that nobody reports during a collection is unmapped.
//!
//! ```text
//!          started_copying           copy phase             done_copying
//! from:  [A][B][C][D]  ──►  free empty, keep dense/pinned ──►  release evacuated
//! to:    []                  evacuate sparse into fresh       reset liveness
//! ```

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use parking_lot::Condvar;

use crate::cell::CellPtr;
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::heap::{CollectionKind, Heap};

use super::block_allocator::{BlockAllocator, BlockSet};

/// Size and alignment of a copied block.
pub const COPIED_BLOCK_SIZE: usize = 32 * 1024;

/// Buffers above this many bytes live in their own mapping.
pub const OVERSIZE_THRESHOLD: usize = COPIED_BLOCK_SIZE / 2;

/// Granularity of copied-space allocations.
pub const COPIED_ALIGNMENT: usize = 16;

const COPIED_BLOCK_MAGIC: u32 = 0x636f_7079;

const PINNED: u8 = 1 << 0;
const NEW: u8 = 1 << 1;
const EVACUATING: u8 = 1 << 2;

/// Rounds a requested length to the bytes it occupies.
#[must_use]
pub const fn storage_size(len: usize) -> usize {
    len.next_multiple_of(COPIED_ALIGNMENT)
}

// ============================================================================
// CopyToken / work items
// ============================================================================

/// Names one [`CopiedBuffer`] inside its owner.
///
/// A token is the buffer's address; it stays valid while the owner is alive,
/// which the copy phase guarantees for every queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyToken(usize);

impl CopyToken {
    /// The token naming `buffer`.
    #[must_use]
    pub fn of(buffer: &CopiedBuffer) -> Self {
        Self(ptr::from_ref(buffer) as usize)
    }

    /// The buffer this token names.
    ///
    /// # Safety
    ///
    /// The owner holding the buffer must still be alive.
    #[must_use]
    pub unsafe fn buffer<'a>(self) -> &'a CopiedBuffer {
        // SAFETY: guaranteed by the caller.
        unsafe { &*(self.0 as *const CopiedBuffer) }
    }
}

#[derive(Debug, Clone, Copy)]
struct CopyWorkItem {
    owner: CellPtr,
    token: CopyToken,
}

// ============================================================================
// CopiedBlock
// ============================================================================

#[repr(C)]
struct CopiedBlockHeader {
    magic: u32,
    flags: AtomicU8,
    live_bytes: AtomicUsize,
    /// Bump offset from the payload start.
    used: AtomicUsize,
    work_list: parking_lot::Mutex<Vec<CopyWorkItem>>,
}

const PAYLOAD_OFFSET: usize = std::mem::size_of::<CopiedBlockHeader>().next_multiple_of(COPIED_ALIGNMENT);

/// Usable bytes in one copied block.
pub const PAYLOAD_CAPACITY: usize = COPIED_BLOCK_SIZE - PAYLOAD_OFFSET;

/// A handle to an initialized copied block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopiedBlock(NonNull<CopiedBlockHeader>);

// SAFETY: header state is atomic or behind the work-list mutex.
unsafe impl Send for CopiedBlock {}
// SAFETY: see above.
unsafe impl Sync for CopiedBlock {}

impl std::fmt::Debug for CopiedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopiedBlock")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("live_bytes", &self.live_bytes())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

impl CopiedBlock {
    /// Writes a fresh header into `memory`.
    ///
    /// # Safety
    ///
    /// `memory` must be a `COPIED_BLOCK_SIZE`-aligned, writable block.
    unsafe fn initialize(memory: NonNull<u8>, new: bool) -> Self {
        let header = CopiedBlockHeader {
            magic: COPIED_BLOCK_MAGIC,
            flags: AtomicU8::new(if new { NEW } else { 0 }),
            live_bytes: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            work_list: parking_lot::Mutex::new(Vec::new()),
        };
        let ptr = memory.cast::<CopiedBlockHeader>();
        // SAFETY: guaranteed by the caller.
        unsafe { ptr.as_ptr().write(header) };
        Self(ptr)
    }

    /// Drops the header in place before the memory is reused.
    ///
    /// # Safety
    ///
    /// The block must not be used again.
    unsafe fn destroy(self) {
        // SAFETY: the header was written by `initialize`.
        unsafe { ptr::drop_in_place(self.0.as_ptr()) };
    }

    /// The block containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point into the payload of a live copied block.
    unsafe fn of(addr: usize) -> Self {
        let base = addr & !(COPIED_BLOCK_SIZE - 1);
        // SAFETY: guaranteed by the caller.
        let block = Self(unsafe { NonNull::new_unchecked(base as *mut CopiedBlockHeader) });
        debug_assert_eq!(block.header().magic, COPIED_BLOCK_MAGIC);
        block
    }

    fn header(&self) -> &CopiedBlockHeader {
        // SAFETY: a handle always points at an initialized header.
        unsafe { self.0.as_ref() }
    }

    fn base(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn memory(&self) -> NonNull<u8> {
        self.0.cast()
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.header().flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u8, on: bool) {
        if on {
            self.header().flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.header().flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    /// Whether the block must stay where it is this cycle.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.has_flag(PINNED)
    }

    fn pin(&self) {
        self.set_flag(PINNED, true);
    }

    fn is_new(&self) -> bool {
        self.has_flag(NEW)
    }

    fn is_evacuating(&self) -> bool {
        self.has_flag(EVACUATING)
    }

    /// Bytes reported live during the current collection.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.header().live_bytes.load(Ordering::Acquire)
    }

    /// Bytes handed out by the bump allocator.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.header().used.load(Ordering::Acquire)
    }

    #[allow(clippy::cast_precision_loss)]
    fn utilization(&self) -> f64 {
        self.live_bytes() as f64 / PAYLOAD_CAPACITY as f64
    }

    fn report_live_bytes(&self, item: CopyWorkItem, bytes: usize) {
        self.header().live_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.header().work_list.lock().push(item);
    }

    fn take_work_list(&self) -> Vec<CopyWorkItem> {
        std::mem::take(&mut *self.header().work_list.lock())
    }

    /// Forgets this cycle's liveness, pin and evacuation state.
    fn reset_liveness(&self) {
        let header = self.header();
        header.live_bytes.store(0, Ordering::Release);
        header.work_list.lock().clear();
        self.set_flag(PINNED | EVACUATING, false);
    }

    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let header = self.header();
        let used = header.used.load(Ordering::Acquire);
        if PAYLOAD_CAPACITY - used < bytes {
            return None;
        }
        header.used.store(used + bytes, Ordering::Release);
        let addr = self.base() + PAYLOAD_OFFSET + used;
        // SAFETY: payload addresses are never null.
        Some(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }
}

// ============================================================================
// Oversize regions
// ============================================================================

struct OversizeRegion {
    mmap: sys_alloc::Mmap,
    pinned: bool,
}

impl OversizeRegion {
    fn contains(&self, addr: usize) -> bool {
        let start = self.mmap.ptr() as usize;
        addr >= start && addr < start + self.mmap.len()
    }
}

#[derive(Default)]
struct OversizeSet {
    new: BTreeMap<usize, OversizeRegion>,
    old: BTreeMap<usize, OversizeRegion>,
}

impl OversizeSet {
    fn find(&mut self, addr: usize, include_old: bool) -> Option<&mut OversizeRegion> {
        let in_new = self
            .new
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr));
        if in_new.is_some() || !include_old {
            return in_new;
        }
        self.old
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    fn bytes(&self) -> usize {
        self.new.values().chain(self.old.values()).map(|r| r.mmap.len()).sum()
    }

    /// Unmaps unpinned regions of the examined generation and clears pins.
    fn sweep(&mut self, kind: CollectionKind) -> usize {
        let mut freed = 0;
        let mut sweep_map = |map: &mut BTreeMap<usize, OversizeRegion>| {
            map.retain(|_, region| {
                let keep = region.pinned;
                region.pinned = false;
                if !keep {
                    freed += region.mmap.len();
                }
                keep
            });
        };
        sweep_map(&mut self.new);
        if kind == CollectionKind::Full {
            sweep_map(&mut self.old);
        }
        let promoted = std::mem::take(&mut self.new);
        self.old.extend(promoted);
        freed
    }
}

// ============================================================================
// CopiedSpace
// ============================================================================

#[derive(Debug, Default)]
struct Generation {
    from_space: Vec<CopiedBlock>,
    to_space: Vec<CopiedBlock>,
}

#[derive(Debug, Default)]
struct SpaceState {
    new_gen: Generation,
    old_gen: Generation,
    block_set: BlockSet,
    allocation_block: Option<CopiedBlock>,
    /// Blocks currently lent to copy visitors.
    loaned: usize,
    copying: Option<CollectionKind>,
    should_do_copy_phase: bool,
    /// Evacuation candidates, released in `done_copying`.
    evacuated: Vec<CopiedBlock>,
}

/// Outcome of [`CopiedSpace::started_copying`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CopyPlan {
    /// Whether evacuation will run.
    pub should_copy: bool,
    /// Blocks selected for evacuation.
    pub blocks_to_copy: usize,
    /// Empty unpinned blocks released up front.
    pub blocks_freed: usize,
    /// Live bytes over usable bytes of the from-space.
    pub utilization: f64,
}

/// The copying space.
pub struct CopiedSpace {
    block_allocator: BlockAllocator,
    state: OrderedMutex<SpaceState>,
    oversize: OrderedMutex<OversizeSet>,
    /// Blocks waiting for a copy visitor.
    blocks_to_copy: SegQueue<CopiedBlock>,
    loan_returned: Condvar,
    min_heap_utilization: f64,
    min_copied_block_utilization: f64,
}

// SAFETY: all state is behind ordered mutexes or in block headers.
unsafe impl Send for CopiedSpace {}
// SAFETY: see above.
unsafe impl Sync for CopiedSpace {}

impl CopiedSpace {
    /// An empty space with the given profitability thresholds.
    #[must_use]
    pub fn new(min_heap_utilization: f64, min_copied_block_utilization: f64) -> Self {
        Self {
            block_allocator: BlockAllocator::new(COPIED_BLOCK_SIZE),
            state: OrderedMutex::with_default(LockOrder::StorageSpace),
            oversize: OrderedMutex::with_default(LockOrder::Oversize),
            blocks_to_copy: SegQueue::new(),
            loan_returned: Condvar::new(),
            min_heap_utilization,
            min_copied_block_utilization,
        }
    }

    fn allocate_block(&self, state: &mut SpaceState, new: bool) -> CopiedBlock {
        let memory = self.block_allocator.allocate();
        // SAFETY: the allocator hands out aligned blocks.
        let block = unsafe { CopiedBlock::initialize(memory, new) };
        state.block_set.add(block.base(), COPIED_BLOCK_SIZE);
        block
    }

    fn release_block(&self, state: &mut SpaceState, block: CopiedBlock) {
        state.block_set.remove(block.base());
        let memory = block.memory();
        // SAFETY: the block left every list and nothing points into it.
        unsafe {
            block.destroy();
            self.block_allocator.deallocate(memory);
        }
    }

    /// Allocates `len` bytes of zeroed storage for the mutator.
    ///
    /// # Panics
    ///
    /// Panics if an oversize mapping cannot be created.
    pub fn allocate(&self, len: usize) -> NonNull<u8> {
        let bytes = storage_size(len.max(1));
        if bytes > OVERSIZE_THRESHOLD {
            return self.allocate_oversize(bytes);
        }
        let mut state = self.state.lock();
        let ptr = match state.allocation_block.and_then(|block| block.allocate(bytes)) {
            Some(ptr) => ptr,
            None => {
                let block = self.allocate_block(&mut state, true);
                state.new_gen.to_space.push(block);
                state.allocation_block = Some(block);
                match block.allocate(bytes) {
                    Some(ptr) => ptr,
                    None => unreachable!("fresh copied block cannot fit {bytes} bytes"),
                }
            }
        };
        drop(state);
        // SAFETY: `bytes` bytes starting at `ptr` belong to this allocation.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        ptr
    }

    fn allocate_oversize(&self, bytes: usize) -> NonNull<u8> {
        let len = bytes.next_multiple_of(sys_alloc::page_size());
        // SAFETY: a fresh anonymous mapping aliases nothing.
        let mmap = match unsafe { sys_alloc::MmapOptions::new().len(len).map_anon() } {
            Ok(mmap) => mmap,
            Err(err) => panic!("failed to map {len} bytes of oversize storage: {err}"),
        };
        let Some(ptr) = NonNull::new(mmap.ptr()) else {
            panic!("oversize mapping returned null");
        };
        self.oversize.lock().new.insert(
            ptr.as_ptr() as usize,
            OversizeRegion {
                mmap,
                pinned: false,
            },
        );
        ptr
    }

    /// Ends mutator allocation into the current block.
    pub fn stop_allocating(&self) {
        self.state.lock().allocation_block = None;
    }

    /// Pins whatever storage contains `addr`. Returns whether any did.
    ///
    /// Used for conservative roots, which may point anywhere into a buffer.
    pub fn pin_if_storage(&self, addr: usize) -> bool {
        let state = self.state.lock();
        let base = addr & !(COPIED_BLOCK_SIZE - 1);
        if state.block_set.contains(base) {
            // SAFETY: the base is a live member of this space.
            let block = unsafe { CopiedBlock::of(base + PAYLOAD_OFFSET) };
            block.pin();
            return true;
        }
        drop(state);
        let mut oversize = self.oversize.lock();
        match oversize.find(addr, true) {
            Some(region) => {
                region.pinned = true;
                true
            }
            None => false,
        }
    }

    /// Records that `owner` keeps the buffer `token` alive during marking.
    ///
    /// Returns the bytes reported. Oversize regions are pinned instead of
    /// queued; in an eden collection old blocks are left alone.
    pub fn copy_later(
        &self,
        kind: CollectionKind,
        owner: Option<CellPtr>,
        token: CopyToken,
        ptr: NonNull<u8>,
        len: usize,
    ) -> usize {
        let bytes = storage_size(len.max(1));
        let addr = ptr.as_ptr() as usize;
        if bytes > OVERSIZE_THRESHOLD {
            if let Some(region) = self.oversize.lock().find(addr, kind == CollectionKind::Full) {
                region.pinned = true;
            }
            return bytes;
        }
        // SAFETY: non-oversize buffers live in copied blocks.
        let block = unsafe { CopiedBlock::of(addr) };
        let Some(owner) = owner else {
            block.pin();
            return bytes;
        };
        if kind == CollectionKind::Full || block.is_new() {
            block.report_live_bytes(CopyWorkItem { owner, token }, bytes);
        }
        bytes
    }

    /// Chooses the blocks to evacuate once marking is complete.
    ///
    /// Full collections consider every block, eden collections only the new
    /// generation. Empty unpinned blocks are released right away.
    #[allow(clippy::cast_precision_loss)]
    pub fn started_copying(&self, kind: CollectionKind) -> CopyPlan {
        let mut state = self.state.lock();
        debug_assert!(state.copying.is_none(), "copy phase already started");
        state.copying = Some(kind);
        state.allocation_block = None;

        let from_space = match kind {
            CollectionKind::Full => {
                let mut blocks = std::mem::take(&mut state.old_gen.to_space);
                blocks.append(&mut state.new_gen.to_space);
                blocks
            }
            CollectionKind::Eden => std::mem::take(&mut state.new_gen.to_space),
        };

        let mut plan = CopyPlan::default();
        let mut live = 0usize;
        let mut usable = 0usize;
        let mut kept = Vec::new();
        let mut candidates = Vec::new();
        for block in from_space {
            if !block.is_pinned() && block.live_bytes() == 0 {
                self.release_block(&mut state, block);
                plan.blocks_freed += 1;
                continue;
            }
            live += block.live_bytes();
            usable += PAYLOAD_CAPACITY;
            if block.is_pinned() || block.utilization() > self.min_copied_block_utilization {
                kept.push(block);
            } else {
                candidates.push(block);
            }
        }

        plan.utilization = if usable == 0 {
            1.0
        } else {
            live as f64 / usable as f64
        };
        plan.should_copy =
            kind == CollectionKind::Eden || plan.utilization <= self.min_heap_utilization;
        if !plan.should_copy {
            kept.append(&mut candidates);
        }
        plan.blocks_to_copy = candidates.len();

        let generation = match kind {
            CollectionKind::Full => &mut state.old_gen,
            CollectionKind::Eden => &mut state.new_gen,
        };
        generation.from_space = candidates.clone();
        generation.to_space = kept;
        state.should_do_copy_phase = plan.should_copy;
        state.evacuated = candidates.clone();
        drop(state);

        for block in candidates {
            block.set_flag(EVACUATING, true);
            self.blocks_to_copy.push(block);
        }
        plan
    }

    /// Whether the current copy phase evacuates anything.
    #[must_use]
    pub fn should_do_copy_phase(&self) -> bool {
        self.state.lock().should_do_copy_phase
    }

    fn next_block_to_copy(&self) -> Option<CopiedBlock> {
        self.blocks_to_copy.pop()
    }

    fn borrow_block(&self) -> CopiedBlock {
        let mut state = self.state.lock();
        state.loaned += 1;
        let new = state.copying == Some(CollectionKind::Eden);
        self.allocate_block(&mut state, new)
    }

    fn recycle_borrowed_block(&self, block: CopiedBlock) {
        let mut state = self.state.lock();
        match state.copying {
            Some(CollectionKind::Eden) => state.new_gen.to_space.push(block),
            _ => state.old_gen.to_space.push(block),
        }
        state.loaned -= 1;
        if state.loaned == 0 {
            self.loan_returned.notify_all();
        }
    }

    /// Ends the copy phase.
    ///
    /// Waits until every visitor has returned its borrowed block, releases
    /// evacuated blocks, promotes the new generation and resets per-cycle
    /// liveness. Returns the oversize bytes unmapped.
    pub fn done_copying(&self) -> usize {
        let mut state = self.state.lock();
        while state.loaned > 0 {
            state.wait(&self.loan_returned);
        }
        let Some(kind) = state.copying.take() else {
            return 0;
        };
        state.should_do_copy_phase = false;

        for block in std::mem::take(&mut state.evacuated) {
            self.release_block(&mut state, block);
        }
        state.old_gen.from_space.clear();
        state.new_gen.from_space.clear();

        let promoted = std::mem::take(&mut state.new_gen.to_space);
        for &block in &promoted {
            block.set_flag(NEW, false);
        }
        state.old_gen.to_space.extend(promoted);
        for block in &state.old_gen.to_space {
            block.reset_liveness();
        }
        state.block_set.rebuild(|_| COPIED_BLOCK_SIZE);
        debug_assert_eq!(state.block_set.len(), state.old_gen.to_space.len());
        drop(state);

        self.oversize.lock().sweep(kind)
    }

    /// Bytes handed out to live and dead buffers.
    #[must_use]
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        let blocks: usize = [&state.new_gen, &state.old_gen]
            .iter()
            .flat_map(|g| g.to_space.iter().chain(g.from_space.iter()))
            .map(CopiedBlock::used_bytes)
            .sum();
        drop(state);
        blocks + self.oversize.lock().bytes()
    }

    /// Bytes of block memory and oversize mappings in use.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let blocks = self.state.lock().block_set.len() * COPIED_BLOCK_SIZE;
        blocks + self.oversize.lock().bytes()
    }

    /// Bytes obtained from the system for blocks, pooled blocks included.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.block_allocator.committed_bytes() + self.oversize.lock().bytes()
    }

    /// Returns pooled blocks to the system.
    pub fn shrink(&self) -> usize {
        self.block_allocator.release_free_blocks()
    }

    /// Number of live blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().block_set.len()
    }

    /// Number of oversize regions.
    #[must_use]
    pub fn oversize_count(&self) -> usize {
        let oversize = self.oversize.lock();
        oversize.new.len() + oversize.old.len()
    }
}

impl Drop for CopiedSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let blocks: Vec<_> = [&mut state.new_gen, &mut state.old_gen]
            .into_iter()
            .flat_map(|g| g.to_space.drain(..).chain(g.from_space.drain(..)))
            .chain(state.evacuated.drain(..))
            .collect();
        let mut seen = std::collections::HashSet::new();
        for block in blocks {
            if seen.insert(block.base()) {
                let memory = block.memory();
                // SAFETY: the space is going away; no buffer outlives it.
                unsafe {
                    block.destroy();
                    self.block_allocator.deallocate(memory);
                }
            }
        }
    }
}

impl std::fmt::Debug for CopiedSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopiedSpace")
            .field("blocks", &self.block_count())
            .field("oversize", &self.oversize_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// CopyVisitor
// ============================================================================

/// A copy-phase worker: evacuates queued blocks into borrowed to-space blocks.
pub struct CopyVisitor<'a> {
    space: &'a CopiedSpace,
    current: Option<CopiedBlock>,
    bytes_copied: usize,
}

impl<'a> CopyVisitor<'a> {
    pub(crate) const fn new(space: &'a CopiedSpace) -> Self {
        Self {
            space,
            current: None,
            bytes_copied: 0,
        }
    }

    /// Prepares for a copy phase.
    pub fn start_copying(&mut self) {
        debug_assert!(self.current.is_none());
        self.bytes_copied = 0;
    }

    /// Drains the shared queue of blocks to evacuate.
    pub fn copy_from_shared(&mut self) {
        while let Some(block) = self.space.next_block_to_copy() {
            for item in block.take_work_list() {
                // SAFETY: queued owners were marked this cycle and are alive.
                unsafe { item.owner.copy_backing_store(self, item.token) };
            }
        }
    }

    /// Returns the borrowed block to the space.
    pub fn done_copying(&mut self) {
        if let Some(block) = self.current.take() {
            self.space.recycle_borrowed_block(block);
        }
    }

    /// Bump-allocates `bytes` in to-space, borrowing a new block when full.
    pub fn allocate_new_space(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(bytes <= OVERSIZE_THRESHOLD);
        if let Some(ptr) = self.current.and_then(|block| block.allocate(bytes)) {
            return ptr;
        }
        self.done_copying();
        let block = self.space.borrow_block();
        self.current = Some(block);
        match block.allocate(bytes) {
            Some(ptr) => ptr,
            None => unreachable!("fresh copied block cannot fit {bytes} bytes"),
        }
    }

    /// Relocates the buffer named by `token` if its block is being evacuated.
    pub fn copy_buffer(&mut self, token: CopyToken) {
        // SAFETY: tokens are only handed out for buffers of live owners.
        let buffer = unsafe { token.buffer() };
        let Some(old) = NonNull::new(buffer.ptr.load(Ordering::Acquire)) else {
            return;
        };
        let bytes = storage_size(buffer.len().max(1));
        if bytes > OVERSIZE_THRESHOLD {
            return;
        }
        // SAFETY: non-oversize buffers live in copied blocks.
        let block = unsafe { CopiedBlock::of(old.as_ptr() as usize) };
        if !block.is_evacuating() {
            return;
        }
        let new = self.allocate_new_space(bytes);
        // SAFETY: both ranges are `bytes` long and in different blocks.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), bytes) };
        buffer.ptr.store(new.as_ptr(), Ordering::Release);
        self.bytes_copied += bytes;
    }

    /// Bytes relocated by this visitor.
    #[must_use]
    pub const fn bytes_copied(&self) -> usize {
        self.bytes_copied
    }
}

impl Drop for CopyVisitor<'_> {
    fn drop(&mut self) {
        self.done_copying();
    }
}

// ============================================================================
// CopiedBuffer
// ============================================================================

/// A variable-length byte buffer stored in the copying space.
///
/// The storage may move during any collection, so raw access is `unsafe` and
/// must not span an allocation. A cell holding a buffer reports it when
/// traced; replacing a buffer inside an already-published cell must be
/// followed by [`Heap::write_barrier_for`] on that cell, which
/// [`reallocate`](Self::reallocate) does.
pub struct CopiedBuffer {
    ptr: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl CopiedBuffer {
    /// A zeroed buffer of `len` bytes.
    #[must_use]
    pub fn new(heap: &Heap, len: usize) -> Self {
        let ptr = if len == 0 {
            ptr::null_mut()
        } else {
            heap.allocate_storage(len).as_ptr()
        };
        Self {
            ptr: AtomicPtr::new(ptr),
            len: AtomicUsize::new(len),
        }
    }

    /// A buffer with no storage.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the buffer has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current storage address, null when empty.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    /// The bytes.
    ///
    /// # Safety
    ///
    /// No collection may run while the slice is alive, and no other thread
    /// may write the buffer.
    #[must_use]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        let ptr = self.as_ptr();
        if ptr.is_null() {
            return &[];
        }
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(ptr, self.len()) }
    }

    /// The bytes, mutably.
    ///
    /// # Safety
    ///
    /// As for [`as_slice`](Self::as_slice), and no other reference to the
    /// bytes may exist.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        let ptr = self.as_ptr();
        if ptr.is_null() {
            return &mut [];
        }
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.len()) }
    }

    /// Reads byte `index`.
    ///
    /// # Safety
    ///
    /// No collection may run concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub unsafe fn read_at(&self, index: usize) -> u8 {
        assert!(index < self.len(), "index {index} out of bounds");
        // SAFETY: in bounds; no collection moves the storage meanwhile.
        unsafe { self.as_ptr().add(index).read() }
    }

    /// Writes byte `index`.
    ///
    /// # Safety
    ///
    /// No collection may run concurrently, and no slice of the buffer may be
    /// alive.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub unsafe fn write_at(&self, index: usize, byte: u8) {
        assert!(index < self.len(), "index {index} out of bounds");
        // SAFETY: in bounds; no collection moves the storage meanwhile.
        unsafe { self.as_ptr().add(index).write(byte) };
    }

    /// Resizes to `len` bytes, keeping the common prefix.
    ///
    /// The new storage is young, so `owner` goes through the write barrier.
    pub fn reallocate(&self, heap: &Heap, owner: impl Into<CellPtr>, len: usize) {
        let old = self.as_ptr();
        let new = if len == 0 {
            ptr::null_mut()
        } else {
            heap.allocate_storage(len).as_ptr()
        };
        let keep = self.len().min(len);
        if keep > 0 && !old.is_null() {
            // SAFETY: both buffers hold at least `keep` bytes.
            unsafe { ptr::copy_nonoverlapping(old, new, keep) };
        }
        self.ptr.store(new, Ordering::Release);
        self.len.store(len, Ordering::Release);
        heap.write_barrier_for(owner.into());
    }
}

impl Default for CopiedBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for CopiedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopiedBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
