//! Scoped local handles backed by per-thread handle stacks.
//!
//! A [`HandleScope`] records the height of its thread's stack on entry and
//! truncates that stack on drop. Every [`Local`] created through it is a root until then,
//! and its lifetime is tied to the scope so it cannot outlive the slot.

use std::cell::Cell as StdCell;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::cell::{Cell, CellRef};
use crate::heap::Heap;

/// A region of the handle stack.
///
/// Scopes nest strictly; a scope is `!Send` so it is dropped on the thread
/// that opened it.
pub struct HandleScope<'heap> {
    heap: &'heap Heap,
    height: usize,
    level: u32,
    _marker: PhantomData<*mut ()>,
}

impl<'heap> HandleScope<'heap> {
    /// Opens a scope on `heap`'s handle stack.
    ///
    /// # Panics
    ///
    /// Panics if scopes nest more than `u32::MAX` deep.
    pub fn new(heap: &'heap Heap) -> Self {
        let mut tables = heap.root_tables().lock();
        let stack = tables.local_stack();
        let height = stack.slots.len();
        let level = stack.scope_level;
        stack.scope_level = level.checked_add(1).expect("HandleScope level overflow");
        Self {
            heap,
            height,
            level,
            _marker: PhantomData,
        }
    }

    /// Roots `cell` until this scope ends.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is not a live cell of the heap.
    pub fn handle<'scope, T: Cell>(&'scope self, cell: CellRef<T>) -> Local<'scope, T> {
        self.heap
            .root(cell, |tables, cell| tables.local_stack().slots.push(Some(cell)));
        Local {
            cell,
            _marker: PhantomData,
        }
    }

    /// Moves `value` into a new cell rooted until this scope ends.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a collector callback.
    pub fn allocate<'scope, T: Cell>(&'scope self, value: T) -> Local<'scope, T> {
        let (cell, ()) = self.heap.allocate_rooted(value, |tables, cell| {
            tables.local_stack().slots.push(Some(cell));
        });
        Local {
            cell,
            _marker: PhantomData,
        }
    }

    /// Nesting depth: 1 for the outermost scope.
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level + 1
    }

    /// The heap this scope roots into.
    #[must_use]
    pub const fn heap(&self) -> &'heap Heap {
        self.heap
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        let mut tables = self.heap.root_tables().lock();
        let stack = tables.local_stack();
        assert_eq!(stack.scope_level, self.level + 1, "HandleScope dropped out of order");
        stack.slots.truncate(self.height);
        stack.scope_level = self.level;
        if self.level == 0 {
            tables.locals.remove(&std::thread::current().id());
        }
    }
}

impl std::fmt::Debug for HandleScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleScope")
            .field("level", &self.level())
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// A cell rooted by a [`HandleScope`].
pub struct Local<'scope, T: Cell> {
    cell: CellRef<T>,
    _marker: PhantomData<&'scope ()>,
}

impl<T: Cell> Local<'_, T> {
    /// The rooted cell.
    #[must_use]
    pub const fn cell(&self) -> CellRef<T> {
        self.cell
    }
}

impl<T: Cell> Deref for Local<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the scope roots the cell for the whole of `'scope`.
        unsafe { self.cell.get() }
    }
}

impl<T: Cell> Clone for Local<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Cell> Copy for Local<'_, T> {}

impl<T: Cell + std::fmt::Debug> std::fmt::Debug for Local<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Local").field(&**self).finish()
    }
}

/// A scope that can hand one local back to its parent.
///
/// The parent slot is reserved before the inner scope opens, so escaping
/// does not disturb the parent's stack discipline.
pub struct EscapableHandleScope<'heap> {
    inner: HandleScope<'heap>,
    escape_slot: usize,
    escaped: StdCell<bool>,
}

impl<'heap> EscapableHandleScope<'heap> {
    /// Reserves a slot in the enclosing scope and opens a new one.
    pub fn new(heap: &'heap Heap) -> Self {
        let mut tables = heap.root_tables().lock();
        let stack = tables.local_stack();
        let escape_slot = stack.slots.len();
        stack.slots.push(None);
        drop(tables);
        Self {
            inner: HandleScope::new(heap),
            escape_slot,
            escaped: StdCell::new(false),
        }
    }

    /// Roots `cell` until this scope ends.
    pub fn handle<'scope, T: Cell>(&'scope self, cell: CellRef<T>) -> Local<'scope, T> {
        self.inner.handle(cell)
    }

    /// Moves `value` into a new cell rooted until this scope ends.
    pub fn allocate<'scope, T: Cell>(&'scope self, value: T) -> Local<'scope, T> {
        self.inner.allocate(value)
    }

    /// Moves `local` into the slot reserved in `parent`.
    ///
    /// # Panics
    ///
    /// Panics if called twice, or in debug builds if `parent` is not the
    /// directly enclosing scope.
    pub fn escape<'parent, T: Cell>(
        &self,
        parent: &'parent HandleScope<'_>,
        local: Local<'_, T>,
    ) -> Local<'parent, T> {
        assert!(
            !self.escaped.replace(true),
            "EscapableHandleScope::escape() can only be called once"
        );
        debug_assert_eq!(
            parent.level() + 1,
            self.inner.level(),
            "escape() called with incorrect parent scope"
        );
        self.inner.heap.root_tables().lock().local_stack().slots[self.escape_slot] =
            Some(local.cell.as_cell());
        Local {
            cell: local.cell,
            _marker: PhantomData,
        }
    }
}

impl std::fmt::Debug for EscapableHandleScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscapableHandleScope")
            .field("inner", &self.inner)
            .field("escaped", &self.escaped.get())
            .finish()
    }
}
