//! Handles: roots held outside the heap.
//!
//! Three tables live behind the heap's root-tables lock:
//! - strong slots, each owned by a [`Strong`] handle
//! - one handle stack per thread, backing [`HandleScope`] locals
//! - weak slots owned by [`Weak`] handles
//!
//! The protected-value set sits next to them; it is reference counted so
//! independent subsystems can protect the same cell.

mod local;
mod weak;

pub use local::{EscapableHandleScope, HandleScope, Local};
pub use weak::{Weak, WeakHandleOwner};

pub(crate) use weak::{PendingFinalizer, WeakSlot};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::cell::{Cell, CellPtr, CellRef};
use crate::heap::Heap;
use crate::space::block::MarkedBlock;

/// A slab of slots addressed by index, reusing freed indices.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slots<T> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> usize {
        if let Some(index) = self.free.pop() {
            self.entries[index] = Some(value);
            index
        } else {
            self.entries.push(Some(value));
            self.entries.len() - 1
        }
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.entries.get_mut(index)?.take();
        if value.is_some() {
            self.free.push(index);
        }
        value
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)?.as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

/// The handle stack of one thread.
///
/// Scopes only ever truncate their own thread's stack, so a scope closing on
/// one thread never unroots another thread's locals.
#[derive(Debug, Default)]
pub(crate) struct HandleStack {
    pub(crate) slots: Vec<Option<CellPtr>>,
    pub(crate) scope_level: u32,
}

/// Every root table of a heap.
#[derive(Debug)]
pub(crate) struct RootTables {
    pub(crate) strong: Slots<CellPtr>,
    pub(crate) protected: HashMap<CellPtr, usize>,
    pub(crate) locals: HashMap<ThreadId, HandleStack>,
    pub(crate) weak: Slots<WeakSlot>,
}

impl RootTables {
    pub(crate) fn new() -> Self {
        Self {
            strong: Slots::new(),
            protected: HashMap::new(),
            locals: HashMap::new(),
            weak: Slots::new(),
        }
    }

    /// Increments the protect count of `cell`.
    pub(crate) fn protect(&mut self, cell: CellPtr) {
        *self.protected.entry(cell).or_insert(0) += 1;
    }

    /// Decrements the protect count. Returns `true` once it reaches zero.
    pub(crate) fn unprotect(&mut self, cell: CellPtr) -> bool {
        let Some(count) = self.protected.get_mut(&cell) else {
            debug_assert!(false, "unprotect of unprotected cell {cell:?}");
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.protected.remove(&cell);
            return true;
        }
        false
    }

    /// Calls `f` for every strong, protected and local root.
    pub(crate) fn for_each_strong_root(&self, mut f: impl FnMut(CellPtr)) {
        for &cell in self.protected.keys() {
            f(cell);
        }
        for &cell in self.strong.iter() {
            f(cell);
        }
        for stack in self.locals.values() {
            for &cell in stack.slots.iter().flatten() {
                f(cell);
            }
        }
    }

    /// The calling thread's handle stack, created on first use.
    pub(crate) fn local_stack(&mut self) -> &mut HandleStack {
        self.locals.entry(std::thread::current().id()).or_default()
    }

    /// Owned weak slots whose referent is not marked yet.
    pub(crate) fn unmarked_owned_weak(&self) -> Vec<(CellPtr, Arc<dyn WeakHandleOwner>, usize)> {
        self.weak
            .iter()
            .filter_map(|slot| {
                let cell = slot.cell?;
                let owner = slot.owner.as_ref()?;
                (!is_marked(cell)).then(|| (cell, Arc::clone(owner), slot.context))
            })
            .collect()
    }

    /// Clears every weak slot whose referent died this cycle.
    ///
    /// Returns the finalizers to run for owned slots, and the number of
    /// slots cleared.
    pub(crate) fn reap_weak(&mut self) -> (Vec<PendingFinalizer>, usize) {
        let mut pending = Vec::new();
        let mut cleared = 0;
        for slot in self.weak.iter_mut() {
            let Some(cell) = slot.cell else {
                continue;
            };
            if is_marked(cell) {
                continue;
            }
            slot.cell = None;
            cleared += 1;
            if let Some(owner) = &slot.owner {
                pending.push(PendingFinalizer {
                    cell,
                    owner: Arc::clone(owner),
                    context: slot.context,
                });
            }
        }
        (pending, cleared)
    }

    /// Clears every weak slot, for heap teardown.
    pub(crate) fn clear_all_weak(&mut self) -> Vec<PendingFinalizer> {
        let mut pending = Vec::new();
        for slot in self.weak.iter_mut() {
            let Some(cell) = slot.cell.take() else {
                continue;
            };
            if let Some(owner) = &slot.owner {
                pending.push(PendingFinalizer {
                    cell,
                    owner: Arc::clone(owner),
                    context: slot.context,
                });
            }
        }
        pending
    }
}

fn is_marked(cell: CellPtr) -> bool {
    // SAFETY: weak slots only hold cells that were alive at the last reap.
    let (block, index) = unsafe { MarkedBlock::of(cell) };
    block.is_marked(index)
}

/// A strong reference to a cell, held in the heap's handle table.
///
/// The referent stays alive until the handle is dropped.
///
/// # Example
///
/// ```
/// use gengc::{Heap, HeapConfig, Strong};
///
/// let heap = Heap::new(HeapConfig::default());
/// let strong = Strong::allocate(&heap, 42u64);
/// heap.collect_all_garbage();
/// assert_eq!(*strong, 42);
/// ```
pub struct Strong<'heap, T: Cell> {
    heap: &'heap Heap,
    index: usize,
    cell: CellRef<T>,
    _marker: PhantomData<T>,
}

impl<'heap, T: Cell> Strong<'heap, T> {
    /// Roots `cell` in `heap`'s handle table.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is not a live cell of `heap`, which happens when
    /// another thread collected it before it was rooted. Use
    /// [`Strong::allocate`] to root a new cell.
    pub fn new(heap: &'heap Heap, cell: CellRef<T>) -> Self {
        let index = heap.root(cell, |tables, cell| tables.strong.insert(cell));
        Self {
            heap,
            index,
            cell,
            _marker: PhantomData,
        }
    }

    /// Moves `value` into a new cell rooted in `heap`'s handle table.
    ///
    /// The cell is rooted before any collection can start, so this is safe
    /// while other threads collect.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a collector callback.
    pub fn allocate(heap: &'heap Heap, value: T) -> Self {
        let (cell, index) = heap.allocate_rooted(value, |tables, cell| tables.strong.insert(cell));
        Self {
            heap,
            index,
            cell,
            _marker: PhantomData,
        }
    }

    /// The rooted cell.
    #[must_use]
    pub const fn cell(&self) -> CellRef<T> {
        self.cell
    }

    /// Points the handle at another cell.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is not a live cell of the heap.
    pub fn set(&mut self, cell: CellRef<T>) {
        let index = self.index;
        self.heap.root(cell, |tables, cell| {
            if let Some(slot) = tables.strong.get_mut(index) {
                *slot = cell;
            }
        });
        self.cell = cell;
    }
}

impl<T: Cell> Deref for Strong<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the handle table roots the cell for as long as `self` lives.
        unsafe { self.cell.get() }
    }
}

impl<T: Cell> Clone for Strong<'_, T> {
    fn clone(&self) -> Self {
        Self::new(self.heap, self.cell)
    }
}

impl<T: Cell> Drop for Strong<'_, T> {
    fn drop(&mut self) {
        self.heap.root_tables().lock().strong.remove(self.index);
    }
}

impl<T: Cell + std::fmt::Debug> std::fmt::Debug for Strong<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Strong").field(&**self).finish()
    }
}
