//! Scoped guards that keep collections from starting.
//!
//! While any guard is alive, allocation-triggered collections are skipped
//! and an explicit [`Heap::collect`] is a protocol violation. Guards nest
//! through a depth counter on the heap.

use std::marker::PhantomData;

use crate::heap::Heap;

/// Defers collection until dropped, then collects if the heuristics ask for
/// it.
///
/// # Example
///
/// ```
/// use gengc::{DeferGc, Heap, HeapConfig};
///
/// let heap = Heap::new(HeapConfig::default());
/// {
///     let _defer = DeferGc::new(&heap);
///     assert!(heap.is_deferred());
///     for i in 0..1000u64 {
///         heap.allocate(i);
///     }
/// }
/// assert!(!heap.is_deferred());
/// ```
#[must_use = "collection is only deferred while the guard is alive"]
pub struct DeferGc<'heap> {
    heap: &'heap Heap,
    _marker: PhantomData<*mut ()>,
}

impl<'heap> DeferGc<'heap> {
    /// Enters a deferral scope.
    pub fn new(heap: &'heap Heap) -> Self {
        heap.increment_defer_depth();
        Self {
            heap,
            _marker: PhantomData,
        }
    }
}

impl Drop for DeferGc<'_> {
    fn drop(&mut self) {
        self.heap.decrement_defer_depth();
        self.heap.collect_if_necessary_or_defer();
    }
}

impl std::fmt::Debug for DeferGc<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferGc").finish_non_exhaustive()
    }
}

/// Defers collection until dropped, without collecting afterwards.
///
/// For stretches of work that must not observe cells moving or dying, such
/// as processing a profiler log; the next allocation decides whether to
/// collect.
#[must_use = "collection is only deferred while the guard is alive"]
pub struct DeferGcForAWhile<'heap> {
    heap: &'heap Heap,
    _marker: PhantomData<*mut ()>,
}

impl<'heap> DeferGcForAWhile<'heap> {
    /// Enters a deferral scope.
    pub fn new(heap: &'heap Heap) -> Self {
        heap.increment_defer_depth();
        Self {
            heap,
            _marker: PhantomData,
        }
    }
}

impl Drop for DeferGcForAWhile<'_> {
    fn drop(&mut self) {
        self.heap.decrement_defer_depth();
    }
}

impl std::fmt::Debug for DeferGcForAWhile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferGcForAWhile").finish_non_exhaustive()
    }
}
