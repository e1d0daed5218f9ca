//! The per-thread marking engine.
//!
//! A [`SlotVisitor`] owns a local [`MarkStackArray`]. Appending a cell
//! test-and-sets its mark bit; only the thread that flips the bit pushes the
//! cell, so each cell's children are visited exactly once no matter how many
//! markers race on it.
//!
//! Runs of slots such as [`PropertyStorage`](crate::PropertyStorage) are
//! queued as mark sets while a cell is being visited and walked slot by slot
//! during the drain.
//!
//! With more than one marker, visitors periodically donate work to the shared
//! stack and meet in [`SlotVisitor::drain_from_shared`] until every stack is
//! empty.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::cell::{CellPtr, Value, WriteBarrier};
use crate::heap::{CollectionKind, Heap};
use crate::roots::{UnconditionalFinalizer, WeakReferenceHarvester};
use crate::space::block::MarkedBlock;
use crate::space::copied::{CopiedBuffer, CopyToken};
use crate::trace::Trace;

use super::conservative::ConservativeRoots;
use super::mark_stack::MarkStackArray;
use super::shared::{SharedMarkingData, OPAQUE_ROOT_MERGE_THRESHOLD};

/// Cells visited between two attempts to donate work.
const MIN_SCANS_BETWEEN_REBALANCE: usize = 100;

/// Role of a marker in [`SlotVisitor::drain_from_shared`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedDrainMode {
    /// The collecting thread: detects termination and returns.
    Master,
    /// A helper: returns once the master signals the end of the round.
    Slave,
}

/// A contiguous run of slots queued for a later walk.
#[derive(Clone, Copy)]
struct MarkSet {
    slots: NonNull<WriteBarrier>,
    len: usize,
}

/// Marks cells and visits their children.
pub struct SlotVisitor<'a> {
    heap: &'a Heap,
    shared: &'a SharedMarkingData,
    kind: CollectionKind,
    stack: MarkStackArray,
    mark_sets: Vec<MarkSet>,
    opaque_roots: HashSet<usize>,
    current_cell: Option<CellPtr>,
    visit_count: usize,
    bytes_visited: usize,
    bytes_copied: usize,
    extra_memory_visited: usize,
}

impl<'a> SlotVisitor<'a> {
    pub(crate) fn new(heap: &'a Heap, kind: CollectionKind) -> Self {
        let shared = heap.marking_data();
        Self {
            heap,
            shared,
            kind,
            stack: MarkStackArray::new(Arc::clone(shared.segment_allocator())),
            mark_sets: Vec::new(),
            opaque_roots: HashSet::new(),
            current_cell: None,
            visit_count: 0,
            bytes_visited: 0,
            bytes_copied: 0,
            extra_memory_visited: 0,
        }
    }

    /// The heap being collected.
    #[must_use]
    pub const fn heap(&self) -> &'a Heap {
        self.heap
    }

    /// Scope of the running collection.
    #[must_use]
    pub const fn collection_kind(&self) -> CollectionKind {
        self.kind
    }

    /// The cell whose children are being visited, if any.
    #[must_use]
    pub const fn current_cell(&self) -> Option<CellPtr> {
        self.current_cell
    }

    // ------------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------------

    /// Marks `cell` and queues it unless another visit already did.
    #[inline]
    pub fn append(&mut self, cell: CellPtr) {
        // SAFETY: cells handed to the visitor are allocated heap cells.
        let (block, index) = unsafe { MarkedBlock::of(cell) };
        if block.test_and_set_marked(index) {
            return;
        }
        self.push_marked(cell, block);
    }

    /// Appends `value` if it refers to a cell.
    #[inline]
    pub fn append_value(&mut self, value: Value) {
        if let Some(cell) = value.as_cell() {
            self.append(cell);
        }
    }

    /// Appends every cell in a run of slots.
    ///
    /// While a cell is being visited the run is queued as a mark set and
    /// walked during the drain; at root level it is walked right away.
    pub fn append_values(&mut self, slots: &[WriteBarrier]) {
        if slots.is_empty() {
            return;
        }
        if self.current_cell.is_some() {
            self.mark_sets.push(MarkSet {
                slots: NonNull::from(slots).cast(),
                len: slots.len(),
            });
            return;
        }
        for slot in slots {
            self.append_value(slot.get());
        }
    }

    /// Queues `cell` for a visit whether or not it is already marked.
    ///
    /// Used for remembered cells, whose marks survive from the previous
    /// collection but whose children changed since.
    pub fn unconditionally_append(&mut self, cell: CellPtr) {
        // SAFETY: remembered cells are allocated heap cells.
        let (block, index) = unsafe { MarkedBlock::of(cell) };
        block.test_and_set_marked(index);
        self.push_marked(cell, block);
    }

    /// Queues every cell the conservative scan found. They are already marked.
    pub fn append_conservative_roots(&mut self, roots: &ConservativeRoots<'_>) {
        for &cell in roots.roots() {
            // SAFETY: conservative roots were resolved to allocated cells.
            let (block, _) = unsafe { MarkedBlock::of(cell) };
            self.push_marked(cell, block);
        }
    }

    /// Appends every cell reachable through `value`'s fields.
    pub fn append_trace(&mut self, value: &dyn Trace) {
        value.trace(self);
    }

    fn push_marked(&mut self, cell: CellPtr, block: MarkedBlock) {
        // SAFETY: the cell is allocated and marked.
        let class = unsafe { cell.class() };
        if class.is_compound() {
            self.stack.append(cell);
        } else {
            self.visit_count += 1;
            self.bytes_visited += block.cell_size();
        }
    }

    /// Whether `cell` is marked in this collection.
    #[must_use]
    pub fn is_marked(&self, cell: CellPtr) -> bool {
        // SAFETY: cells handed to the visitor are allocated heap cells.
        let (block, index) = unsafe { MarkedBlock::of(cell) };
        block.is_marked(index)
    }

    // ------------------------------------------------------------------------
    // Backing stores and bookkeeping
    // ------------------------------------------------------------------------

    /// Reports a backing store kept alive by the cell being visited.
    pub fn copy_later(&mut self, buffer: &CopiedBuffer) {
        let Some(ptr) = NonNull::new(buffer.as_ptr()) else {
            return;
        };
        let token = CopyToken::of(buffer);
        self.bytes_copied += self.heap.storage().copy_later(
            self.kind,
            self.current_cell,
            token,
            ptr,
            buffer.len(),
        );
    }

    /// Reports off-heap memory owned by the cell being visited.
    pub fn report_extra_memory_visited(&mut self, bytes: usize) {
        self.extra_memory_visited += bytes;
    }

    /// Declares `root` live on behalf of a non-GC structure.
    pub fn add_opaque_root(&mut self, root: usize) {
        if !self.shared.is_parallel() {
            self.shared.add_opaque_root(root);
            return;
        }
        self.opaque_roots.insert(root);
        if self.opaque_roots.len() > OPAQUE_ROOT_MERGE_THRESHOLD {
            self.shared.merge_opaque_roots(&mut self.opaque_roots);
        }
    }

    /// Whether `root` was declared live by any marker.
    #[must_use]
    pub fn contains_opaque_root(&self, root: usize) -> bool {
        self.opaque_roots.contains(&root) || self.shared.contains_opaque_root(root)
    }

    /// Registers a harvester for the rest of this collection.
    pub fn add_weak_reference_harvester(&self, harvester: Arc<dyn WeakReferenceHarvester>) {
        self.shared.add_weak_reference_harvester(harvester);
    }

    /// Registers a finalizer for the rest of this collection.
    pub fn add_unconditional_finalizer(&self, finalizer: Arc<dyn UnconditionalFinalizer>) {
        self.shared.add_unconditional_finalizer(finalizer);
    }

    /// Cells visited by this visitor since its totals were last flushed.
    #[must_use]
    pub const fn visit_count(&self) -> usize {
        self.visit_count
    }

    /// Whether this visitor has no pending work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty() && self.mark_sets.is_empty()
    }

    /// Folds this visitor's totals and opaque roots into the shared data.
    pub fn flush(&mut self) {
        self.shared.add_counts(
            std::mem::take(&mut self.visit_count),
            std::mem::take(&mut self.bytes_visited),
            std::mem::take(&mut self.bytes_copied),
            std::mem::take(&mut self.extra_memory_visited),
        );
        self.shared.merge_opaque_roots(&mut self.opaque_roots);
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    fn visit_children(&mut self, cell: CellPtr) {
        // SAFETY: only allocated cells are ever pushed.
        let (block, index) = unsafe { MarkedBlock::of(cell) };
        debug_assert!(block.is_marked(index), "visiting unmarked cell {cell:?}");
        self.visit_count += 1;
        self.bytes_visited += block.cell_size();
        self.current_cell = Some(cell);
        // SAFETY: the cell is allocated, marked and not swept this cycle.
        unsafe { cell.visit_children(self) };
        self.current_cell = None;
    }

    /// Visits cells until the local stack and mark sets are empty.
    pub fn drain(&mut self) {
        loop {
            while self.stack.refill() {
                for _ in 0..MIN_SCANS_BETWEEN_REBALANCE {
                    let Some(cell) = self.stack.remove_last() else {
                        break;
                    };
                    self.visit_children(cell);
                }
                self.donate_known_parallel();
            }
            let Some(set) = self.mark_sets.pop() else {
                break;
            };
            // SAFETY: the set points into a marked cell, alive all phase.
            let slots = unsafe { std::slice::from_raw_parts(set.slots.as_ptr(), set.len) };
            for slot in slots {
                self.append_value(slot.get());
            }
        }
    }

    /// Offers work to idle markers if the shared stack ran dry.
    fn donate_known_parallel(&mut self) {
        if !self.shared.is_parallel() || self.stack.size() < 2 {
            return;
        }
        let Some(mut state) = self.shared.try_lock() else {
            return;
        };
        if !state.shared_stack.is_empty() {
            return;
        }
        self.stack.donate_some_cells_to(&mut state.shared_stack);
        let wake = state.active_markers < self.shared.number_of_markers();
        drop(state);
        if wake {
            self.shared.notify_all();
        }
    }

    /// Donates unconditionally.
    pub fn donate(&mut self) {
        if !self.shared.is_parallel() || self.stack.size() < 2 {
            return;
        }
        let mut state = self.shared.lock();
        self.stack.donate_some_cells_to(&mut state.shared_stack);
        drop(state);
        self.shared.notify_all();
    }

    /// Donates, then drains what is left.
    pub fn donate_and_drain(&mut self) {
        self.donate();
        self.drain();
    }

    /// Cooperates with the other markers until no work is left anywhere.
    pub fn drain_from_shared(&mut self, mode: SharedDrainMode) {
        debug_assert!(self.shared.is_parallel());
        self.shared.lock().active_markers += 1;
        loop {
            {
                let mut state = self.shared.lock();
                state.active_markers -= 1;
                match mode {
                    SharedDrainMode::Master => loop {
                        if state.active_markers == 0 && state.shared_stack.is_empty() {
                            drop(state);
                            self.shared.notify_all();
                            return;
                        }
                        if !state.shared_stack.is_empty() {
                            break;
                        }
                        self.shared.wait(&mut state);
                    },
                    SharedDrainMode::Slave => {
                        if state.active_markers == 0 && state.shared_stack.is_empty() {
                            self.shared.notify_all();
                        }
                        while state.shared_stack.is_empty() && !state.should_exit {
                            self.shared.wait(&mut state);
                        }
                        if state.should_exit {
                            return;
                        }
                    }
                }
                let idle = self.shared.number_of_markers() - state.active_markers;
                self.stack.steal_some_cells_from(&mut state.shared_stack, idle);
                state.active_markers += 1;
            }
            self.drain();
        }
    }

    /// Drains this visitor and, with helpers, the whole marker pool.
    ///
    /// Helper threads live for one round and fold their totals into the shared
    /// data before exiting.
    pub fn converge(&mut self) {
        if !self.shared.is_parallel() {
            self.drain();
            return;
        }
        self.shared.reset_exit();
        let heap = self.heap;
        let kind = self.kind;
        let helpers = self.shared.number_of_markers() - 1;
        std::thread::scope(|scope| {
            for _ in 0..helpers {
                scope.spawn(move || {
                    let mut helper = SlotVisitor::new(heap, kind);
                    helper.drain_from_shared(SharedDrainMode::Slave);
                    debug_assert!(helper.is_empty());
                    helper.flush();
                });
            }
            self.donate_and_drain();
            self.drain_from_shared(SharedDrainMode::Master);
            self.shared.signal_exit();
        });
    }
}

impl std::fmt::Debug for SlotVisitor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotVisitor")
            .field("kind", &self.kind)
            .field("stack", &self.stack)
            .field("mark_sets", &self.mark_sets.len())
            .field("visit_count", &self.visit_count)
            .finish_non_exhaustive()
    }
}
