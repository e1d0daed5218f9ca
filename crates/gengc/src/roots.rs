//! Collaborator hooks consulted while gathering roots and resolving weakness.
//!
//! The heap never knows what an interpreter stack, an argument buffer or a
//! weak map looks like. Embedders describe them through these traits and
//! register implementations with the [`Heap`](crate::Heap).

use crate::gc::{ConservativeRoots, HeapRootVisitor, SlotVisitor};
use crate::heap::Heap;

/// A source of precise roots: argument buffers, exception slots, pending
/// sort buffers and the like.
///
/// # Example
///
/// ```
/// use gengc::{HeapRootVisitor, RootProvider, WriteBarrier};
///
/// struct PendingException(WriteBarrier);
///
/// impl RootProvider for PendingException {
///     fn visit_roots(&self, visitor: &mut HeapRootVisitor<'_, '_>) {
///         visitor.visit(&self.0);
///     }
/// }
/// ```
pub trait RootProvider: Send + Sync {
    /// Hands every root slot to `visitor`.
    fn visit_roots(&self, visitor: &mut HeapRootVisitor<'_, '_>);
}

/// A raw memory region whose words may point at cells: an interpreter
/// stack, a JIT scratch buffer, a manually managed stack.
pub trait ConservativeRootSource: Send + Sync {
    /// Adds every candidate word of the region to `roots`.
    fn gather_conservative_roots(&self, roots: &mut ConservativeRoots<'_>);
}

/// A hook run repeatedly after strong marking converges.
///
/// Each run may inspect liveness with [`SlotVisitor::is_marked`] and
/// strengthen references with [`SlotVisitor::append`]. The heap keeps
/// running harvesters until none of them produces new work.
pub trait WeakReferenceHarvester: Send + Sync {
    /// Strengthens whatever references are now known to be needed.
    fn visit_weak_references(&self, visitor: &mut SlotVisitor<'_>);
}

/// A hook run once per collection after marking is final, whether or not
/// the object that registered it survived.
pub trait UnconditionalFinalizer: Send + Sync {
    /// Drops references to cells that did not survive.
    ///
    /// Liveness can be queried with [`Heap::is_marked`].
    fn finalize_unconditionally(&self, heap: &Heap);
}
