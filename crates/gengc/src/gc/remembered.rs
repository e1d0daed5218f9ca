//! The remembered set and the write-barrier buffer in front of it.
//!
//! An eden collection does not rescan old cells. An old cell that had a
//! reference stored into it since the last collection is therefore
//! *remembered*: the barrier queues it, and the next eden collection visits
//! it again as an extra root.
//!
//! ```text
//! store into old A ──► buffer [A, C, ...] ──flush──► remembered bit + list
//!                                                        │
//!                     eden collection: snapshot ◄────────┘  (roots)
//! ```

use crossbeam_queue::ArrayQueue;

use crate::cell::CellPtr;
use crate::space::block::MarkedBlock;

use super::sync::{LockOrder, OrderedMutex};

/// Cells buffered before the barrier takes the remembered-set lock.
pub const WRITE_BARRIER_BUFFER_CAPACITY: usize = 256;

/// Lock-free buffer of barrier hits awaiting a flush.
pub struct WriteBarrierBuffer {
    queue: ArrayQueue<CellPtr>,
}

impl WriteBarrierBuffer {
    /// An empty buffer of [`WRITE_BARRIER_BUFFER_CAPACITY`] entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(WRITE_BARRIER_BUFFER_CAPACITY)
    }

    /// An empty buffer of `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Buffers `cell`. Hands it back when the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(cell)` if there is no room; the caller must flush.
    pub fn push(&self, cell: CellPtr) -> Result<(), CellPtr> {
        self.queue.push(cell)
    }

    /// Takes every buffered cell.
    pub fn drain(&self, mut f: impl FnMut(CellPtr)) {
        while let Some(cell) = self.queue.pop() {
            f(cell);
        }
    }

    /// Number of buffered cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBarrierBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBarrierBuffer")
            .field("len", &self.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

/// Old cells mutated since they were last scanned.
#[derive(Debug)]
pub struct RememberedSet {
    buffer: WriteBarrierBuffer,
    cells: OrderedMutex<Vec<CellPtr>>,
}

impl RememberedSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: WriteBarrierBuffer::new(),
            cells: OrderedMutex::new(LockOrder::RememberedSet, Vec::new()),
        }
    }

    /// Records a store into `owner`.
    ///
    /// Young owners need nothing: every eden collection scans them anyway.
    /// Old owners are buffered once until the next flush.
    pub fn write_barrier(&self, owner: CellPtr) {
        // SAFETY: barrier owners are allocated heap cells.
        let (block, index) = unsafe { MarkedBlock::of(owner) };
        if block.is_newly_allocated(index) {
            return;
        }
        // SAFETY: as above.
        if unsafe { owner.header() }.is_remembered() {
            return;
        }
        if let Err(owner) = self.buffer.push(owner) {
            let mut cells = self.cells.lock();
            self.buffer.drain(|cell| Self::remember(&mut cells, cell));
            Self::remember(&mut cells, owner);
        }
    }

    /// Adds `cell` to the set right away. A remembered cell is left alone.
    pub fn add_to_remembered_set(&self, cell: CellPtr) {
        let mut cells = self.cells.lock();
        Self::remember(&mut cells, cell);
    }

    fn remember(cells: &mut Vec<CellPtr>, cell: CellPtr) {
        // SAFETY: only allocated heap cells reach the remembered set.
        let (block, index) = unsafe { MarkedBlock::of(cell) };
        if block.test_and_set_remembered(index) {
            return;
        }
        // SAFETY: as above.
        unsafe { cell.header() }.set_remembered();
        cells.push(cell);
    }

    /// Commits every buffered barrier hit.
    pub fn flush(&self) {
        let mut cells = self.cells.lock();
        self.buffer.drain(|cell| Self::remember(&mut cells, cell));
    }

    /// Takes the remembered cells for an eden collection.
    ///
    /// Each cell's header flag is cleared so later stores are tracked afresh;
    /// the block bits stay set until [`did_finish_marking`](Self::did_finish_marking).
    pub fn take_snapshot(&self) -> Vec<CellPtr> {
        self.flush();
        let snapshot = std::mem::take(&mut *self.cells.lock());
        for &cell in &snapshot {
            // SAFETY: remembered cells are old, and old cells only die in a
            // full collection, which empties the set first.
            unsafe { cell.header() }.clear_remembered();
        }
        snapshot
    }

    /// Clears the block bits of a snapshot once marking is done.
    pub fn did_finish_marking(snapshot: &[CellPtr]) {
        for &cell in snapshot {
            // SAFETY: see `take_snapshot`.
            let (block, index) = unsafe { MarkedBlock::of(cell) };
            block.clear_remembered(index);
        }
    }

    /// Forgets everything, for a full collection.
    pub fn clear(&self) {
        let mut cells = self.cells.lock();
        self.buffer.drain(|_| {});
        for cell in cells.drain(..) {
            // SAFETY: see `take_snapshot`.
            let (block, index) = unsafe { MarkedBlock::of(cell) };
            block.clear_remembered(index);
            // SAFETY: as above.
            unsafe { cell.header() }.clear_remembered();
        }
    }

    /// Number of committed cells, not counting the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    /// Whether nothing is committed or buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.cells.lock().is_empty()
    }

    /// Number of buffered, uncommitted barrier hits.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}
