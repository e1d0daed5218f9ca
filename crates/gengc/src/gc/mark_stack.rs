//! Segmented mark stacks and the shared segment allocator.
//!
//! A [`MarkStackArray`] is a stack of fixed-capacity segments. Only the top
//! segment may be partially filled; every segment below it is full. Work is
//! balanced between markers by moving whole segments, so donation never copies
//! cells when there is more than one segment.
//!
//! ```text
//!   top ──► [c c c . . .]   partial
//!           [c c c c c c]   full
//!           [c c c c c c]   full
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cell::CellPtr;

use super::sync::{LockOrder, OrderedMutex};

/// Target footprint of one segment.
pub const SEGMENT_SIZE: usize = 4096;

/// Cells per segment: the footprint minus one word of bookkeeping.
pub const SEGMENT_CAPACITY: usize =
    (SEGMENT_SIZE - std::mem::size_of::<usize>()) / std::mem::size_of::<CellPtr>();

type Segment = Vec<CellPtr>;

// ============================================================================
// SegmentAllocator
// ============================================================================

/// Lock-protected free list of segments shared by every marker.
#[derive(Debug)]
pub struct SegmentAllocator {
    free: OrderedMutex<Vec<Segment>>,
    allocated: AtomicUsize,
}

impl SegmentAllocator {
    /// An empty allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: OrderedMutex::new(LockOrder::SegmentFreeList, Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns an empty segment, reusing a released one when possible.
    pub fn allocate(&self) -> Segment {
        if let Some(segment) = self.free.lock().pop() {
            return segment;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(SEGMENT_CAPACITY)
    }

    /// Takes a segment back.
    pub fn release(&self, mut segment: Segment) {
        debug_assert!(segment.capacity() >= SEGMENT_CAPACITY);
        segment.clear();
        self.free.lock().push(segment);
    }

    /// Frees every pooled segment.
    pub fn shrink(&self) {
        let freed = std::mem::take(&mut *self.free.lock());
        self.allocated.fetch_sub(freed.len(), Ordering::Relaxed);
    }

    /// Segments waiting in the pool.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Segments created and not yet freed.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Default for SegmentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MarkStackArray
// ============================================================================

/// A LIFO stack of cells awaiting child visitation.
pub struct MarkStackArray {
    allocator: Arc<SegmentAllocator>,
    top: Segment,
    /// Full segments below `top`, most recent last.
    previous: Vec<Segment>,
}

impl MarkStackArray {
    /// An empty stack drawing segments from `allocator`.
    #[must_use]
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        let top = allocator.allocate();
        Self {
            allocator,
            top,
            previous: Vec::new(),
        }
    }

    /// Pushes `cell`, linking in a fresh segment when the top one is full.
    #[inline]
    pub fn append(&mut self, cell: CellPtr) {
        if self.top.len() == SEGMENT_CAPACITY {
            self.expand();
        }
        self.top.push(cell);
    }

    fn expand(&mut self) {
        let fresh = self.allocator.allocate();
        let full = std::mem::replace(&mut self.top, fresh);
        self.previous.push(full);
    }

    /// Whether the top segment holds a cell.
    #[inline]
    #[must_use]
    pub fn can_remove_last(&self) -> bool {
        !self.top.is_empty()
    }

    /// Pops from the top segment.
    #[inline]
    pub fn remove_last(&mut self) -> Option<CellPtr> {
        self.top.pop()
    }

    /// Replaces an empty top segment with the next full one.
    ///
    /// Returns `false` when the stack is empty.
    pub fn refill(&mut self) -> bool {
        if self.can_remove_last() {
            return true;
        }
        let Some(next) = self.previous.pop() else {
            return false;
        };
        let empty = std::mem::replace(&mut self.top, next);
        self.allocator.release(empty);
        true
    }

    /// Whether no cell is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top.is_empty() && self.previous.is_empty()
    }

    /// Number of pending cells.
    #[must_use]
    pub fn size(&self) -> usize {
        self.previous.len() * SEGMENT_CAPACITY + self.top.len()
    }

    /// Number of linked segments, the top one included.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.previous.len() + 1
    }

    /// Moves about half of the pending work to `other`.
    ///
    /// Whole full segments are preferred; with a single segment, half of its
    /// cells are moved one by one instead.
    pub fn donate_some_cells_to(&mut self, other: &mut Self) {
        let segments_to_donate = self.segment_count() / 2;
        if segments_to_donate == 0 {
            let cells_to_donate = self.top.len() / 2;
            for _ in 0..cells_to_donate {
                if let Some(cell) = self.remove_last() {
                    other.append(cell);
                }
            }
            return;
        }
        for _ in 0..segments_to_donate {
            if let Some(segment) = self.previous.pop() {
                other.previous.push(segment);
            }
        }
    }

    /// Takes a share of `other`'s work for one of `idle_threads` idle markers.
    ///
    /// Steals one whole segment if `other` has a full one, otherwise
    /// `1/idle_threads` of its cells, rounded up.
    pub fn steal_some_cells_from(&mut self, other: &mut Self, idle_threads: usize) {
        if let Some(segment) = other.previous.pop() {
            self.previous.push(segment);
            return;
        }
        let idle_threads = idle_threads.max(1);
        let cells_to_steal = other.size().div_ceil(idle_threads);
        for _ in 0..cells_to_steal {
            match other.remove_last() {
                Some(cell) => self.append(cell),
                None => break,
            }
        }
    }

    /// Drops every pending cell and returns spare segments.
    pub fn clear(&mut self) {
        self.top.clear();
        for segment in self.previous.drain(..) {
            self.allocator.release(segment);
        }
    }
}

impl Drop for MarkStackArray {
    fn drop(&mut self) {
        self.clear();
        let top = std::mem::take(&mut self.top);
        if top.capacity() != 0 {
            self.allocator.release(top);
        }
    }
}

impl std::fmt::Debug for MarkStackArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkStackArray")
            .field("size", &self.size())
            .field("segments", &self.segment_count())
            .finish()
    }
}
