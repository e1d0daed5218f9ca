//! Weak handles.
//!
//! A weak slot does not keep its referent alive. After marking, slots whose
//! referent died are cleared and their owner, if any, is told through
//! [`WeakHandleOwner::finalize`].
//!
//! Before that, during the weak loop, an owner may rescue its referent by
//! reporting that a non-GC structure still needs it.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cell::{Cell, CellPtr, CellRef};
use crate::gc::SlotVisitor;
use crate::heap::Heap;

/// Decides the fate of weak slots it owns.
pub trait WeakHandleOwner: Send + Sync {
    /// Whether `cell` must survive although only weak slots point at it.
    ///
    /// Called after strong marking converges, once per round of the weak
    /// loop, for every owned slot whose referent is still unmarked. The
    /// visitor answers [`SlotVisitor::contains_opaque_root`] queries.
    fn is_reachable_from_opaque_roots(
        &self,
        _cell: CellPtr,
        _context: usize,
        _visitor: &SlotVisitor<'_>,
    ) -> bool {
        false
    }

    /// Called once the slot's referent is known dead and the slot was
    /// cleared. The cell's destructor has not run yet.
    fn finalize(&self, _cell: CellPtr, _context: usize) {}
}

/// One weak-table entry.
pub(crate) struct WeakSlot {
    pub(crate) cell: Option<CellPtr>,
    pub(crate) owner: Option<Arc<dyn WeakHandleOwner>>,
    pub(crate) context: usize,
}

impl std::fmt::Debug for WeakSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSlot")
            .field("cell", &self.cell)
            .field("has_owner", &self.owner.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// A dead referent awaiting its owner's finalizer.
pub(crate) struct PendingFinalizer {
    pub(crate) cell: CellPtr,
    pub(crate) owner: Arc<dyn WeakHandleOwner>,
    pub(crate) context: usize,
}

impl PendingFinalizer {
    pub(crate) fn run(self) {
        self.owner.finalize(self.cell, self.context);
    }
}

/// A weak reference to a cell.
///
/// # Example
///
/// ```
/// use gengc::{Heap, HeapConfig, Weak};
///
/// let heap = Heap::new(HeapConfig::default());
/// let weak = Weak::new(&heap, heap.allocate(7u32));
/// heap.collect_all_garbage();
/// assert!(weak.get().is_none());
/// ```
pub struct Weak<'heap, T: Cell> {
    heap: &'heap Heap,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<'heap, T: Cell> Weak<'heap, T> {
    /// A weak slot for `cell` with no owner.
    pub fn new(heap: &'heap Heap, cell: CellRef<T>) -> Self {
        Self::insert(heap, cell, None, 0)
    }

    /// A weak slot for `cell` whose fate `owner` decides.
    ///
    /// `context` is handed back to every owner callback.
    pub fn with_owner(
        heap: &'heap Heap,
        cell: CellRef<T>,
        owner: Arc<dyn WeakHandleOwner>,
        context: usize,
    ) -> Self {
        Self::insert(heap, cell, Some(owner), context)
    }

    fn insert(
        heap: &'heap Heap,
        cell: CellRef<T>,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: usize,
    ) -> Self {
        let index = heap.root(cell, |tables, cell| {
            tables.weak.insert(WeakSlot {
                cell: Some(cell),
                owner,
                context,
            })
        });
        Self {
            heap,
            index,
            _marker: PhantomData,
        }
    }

    /// The referent, or `None` once it was collected.
    ///
    /// The returned cell is not rooted.
    #[must_use]
    pub fn get(&self) -> Option<CellRef<T>> {
        let tables = self.heap.root_tables().lock();
        let cell = tables.weak.get(self.index)?.cell?;
        drop(tables);
        // SAFETY: a slot still holding its cell means the cell survived every
        // collection since the slot was created.
        unsafe { cell.downcast::<T>() }
    }

    /// Whether the referent was collected.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.get().is_none()
    }
}

impl<T: Cell> Drop for Weak<'_, T> {
    fn drop(&mut self) {
        self.heap.root_tables().lock().weak.remove(self.index);
    }
}

impl<T: Cell> std::fmt::Debug for Weak<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weak")
            .field("index", &self.index)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}
