//! Uniform entry point for precise root slots.

use crate::cell::{CellPtr, Value, WriteBarrier};
use crate::trace::Trace;

use super::visitor::SlotVisitor;

/// Hands root slots from any container to a [`SlotVisitor`].
///
/// Root sources decide what is a root; the visitor decides how to mark it.
pub struct HeapRootVisitor<'v, 'a> {
    visitor: &'v mut SlotVisitor<'a>,
}

impl<'v, 'a> HeapRootVisitor<'v, 'a> {
    /// Wraps `visitor`.
    pub fn new(visitor: &'v mut SlotVisitor<'a>) -> Self {
        Self { visitor }
    }

    /// Visits the value currently stored in `slot`.
    pub fn visit(&mut self, slot: &WriteBarrier) {
        self.visitor.append_value(slot.get());
    }

    /// Visits every slot of a root buffer.
    pub fn visit_slots(&mut self, slots: &[WriteBarrier]) {
        for slot in slots {
            self.visit(slot);
        }
    }

    /// Visits a value held outside the heap.
    pub fn visit_value(&mut self, value: Value) {
        self.visitor.append_value(value);
    }

    /// Visits a cell held outside the heap.
    pub fn visit_cell(&mut self, cell: CellPtr) {
        self.visitor.append(cell);
    }

    /// Visits every reference reachable through `value`'s fields.
    pub fn visit_trace(&mut self, value: &dyn Trace) {
        self.visitor.append_trace(value);
    }

    /// The underlying visitor.
    pub fn visitor(&mut self) -> &mut SlotVisitor<'a> {
        self.visitor
    }
}

impl std::fmt::Debug for HeapRootVisitor<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRootVisitor").finish_non_exhaustive()
    }
}
