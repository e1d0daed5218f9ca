//! State shared by every marker thread for one collection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Condvar;

use crate::roots::{UnconditionalFinalizer, WeakReferenceHarvester};

use super::mark_stack::{MarkStackArray, SegmentAllocator};
use super::sync::{LockOrder, OrderedMutex, OrderedMutexGuard};

/// Local opaque roots are merged into the shared set past this many entries.
pub const OPAQUE_ROOT_MERGE_THRESHOLD: usize = 1000;

/// Marker coordination, guarded by the marking lock.
pub(crate) struct MarkingState {
    pub(crate) shared_stack: MarkStackArray,
    pub(crate) active_markers: usize,
    pub(crate) should_exit: bool,
    harvesters: Vec<Arc<dyn WeakReferenceHarvester>>,
    finalizers: Vec<Arc<dyn UnconditionalFinalizer>>,
}

/// Shared marking data: overflow stack, opaque roots, per-cycle callback
/// registrations and the counters markers fold their totals into.
pub struct SharedMarkingData {
    segment_allocator: Arc<SegmentAllocator>,
    number_of_markers: usize,
    marking: OrderedMutex<MarkingState>,
    marking_condition: Condvar,
    opaque_roots: OrderedMutex<HashSet<usize>>,
    visit_count: CachePadded<AtomicUsize>,
    bytes_visited: CachePadded<AtomicUsize>,
    bytes_copied: CachePadded<AtomicUsize>,
    extra_memory_visited: CachePadded<AtomicUsize>,
}

impl SharedMarkingData {
    /// Shared data for `number_of_markers` threads, the collector included.
    #[must_use]
    pub fn new(number_of_markers: usize) -> Self {
        let segment_allocator = Arc::new(SegmentAllocator::new());
        Self {
            marking: OrderedMutex::new(
                LockOrder::MarkingState,
                MarkingState {
                    shared_stack: MarkStackArray::new(Arc::clone(&segment_allocator)),
                    active_markers: 0,
                    should_exit: false,
                    harvesters: Vec::new(),
                    finalizers: Vec::new(),
                },
            ),
            segment_allocator,
            number_of_markers: number_of_markers.max(1),
            marking_condition: Condvar::new(),
            opaque_roots: OrderedMutex::with_default(LockOrder::OpaqueRoots),
            visit_count: CachePadded::new(AtomicUsize::new(0)),
            bytes_visited: CachePadded::new(AtomicUsize::new(0)),
            bytes_copied: CachePadded::new(AtomicUsize::new(0)),
            extra_memory_visited: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Marker threads per phase, the collector included.
    #[must_use]
    pub const fn number_of_markers(&self) -> usize {
        self.number_of_markers
    }

    /// Whether more than one thread marks.
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.number_of_markers > 1
    }

    pub(crate) fn segment_allocator(&self) -> &Arc<SegmentAllocator> {
        &self.segment_allocator
    }

    pub(crate) fn lock(&self) -> OrderedMutexGuard<'_, MarkingState> {
        self.marking.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<OrderedMutexGuard<'_, MarkingState>> {
        self.marking.try_lock()
    }

    pub(crate) fn wait(&self, guard: &mut OrderedMutexGuard<'_, MarkingState>) {
        guard.wait(&self.marking_condition);
    }

    pub(crate) fn notify_all(&self) {
        self.marking_condition.notify_all();
    }

    /// Resets counters and the opaque-roots set for a new mark phase.
    pub fn did_start_marking(&self) {
        self.visit_count.store(0, Ordering::Relaxed);
        self.bytes_visited.store(0, Ordering::Relaxed);
        self.bytes_copied.store(0, Ordering::Relaxed);
        self.extra_memory_visited.store(0, Ordering::Relaxed);
        self.opaque_roots.lock().clear();
        let mut state = self.marking.lock();
        debug_assert!(state.shared_stack.is_empty());
        state.active_markers = 0;
        state.should_exit = false;
    }

    /// Lets helper markers start another convergence round.
    pub(crate) fn reset_exit(&self) {
        self.marking.lock().should_exit = false;
    }

    /// Releases every helper still waiting for shared work.
    pub(crate) fn signal_exit(&self) {
        let mut state = self.marking.lock();
        state.should_exit = true;
        drop(state);
        self.marking_condition.notify_all();
    }

    /// Ends the mark phase: drops per-cycle registrations and idle segments.
    pub fn did_finish_marking(&self) {
        let mut state = self.marking.lock();
        debug_assert!(state.shared_stack.is_empty(), "marking finished with shared work left");
        state.harvesters.clear();
        state.finalizers.clear();
        drop(state);
        self.segment_allocator.shrink();
    }

    // ------------------------------------------------------------------------
    // Per-cycle callbacks
    // ------------------------------------------------------------------------

    /// Registers a harvester for this cycle. Registering twice is a no-op.
    pub fn add_weak_reference_harvester(&self, harvester: Arc<dyn WeakReferenceHarvester>) {
        let mut state = self.marking.lock();
        if !state.harvesters.iter().any(|h| Arc::ptr_eq(h, &harvester)) {
            state.harvesters.push(harvester);
        }
    }

    /// Registers a finalizer for this cycle. Registering twice is a no-op.
    pub fn add_unconditional_finalizer(&self, finalizer: Arc<dyn UnconditionalFinalizer>) {
        let mut state = self.marking.lock();
        if !state.finalizers.iter().any(|f| Arc::ptr_eq(f, &finalizer)) {
            state.finalizers.push(finalizer);
        }
    }

    /// Harvesters registered so far this cycle.
    #[must_use]
    pub fn weak_reference_harvesters(&self) -> Vec<Arc<dyn WeakReferenceHarvester>> {
        self.marking.lock().harvesters.clone()
    }

    /// Finalizers registered so far this cycle.
    #[must_use]
    pub fn unconditional_finalizers(&self) -> Vec<Arc<dyn UnconditionalFinalizer>> {
        self.marking.lock().finalizers.clone()
    }

    // ------------------------------------------------------------------------
    // Opaque roots
    // ------------------------------------------------------------------------

    /// Adds one opaque root directly to the shared set.
    pub fn add_opaque_root(&self, root: usize) {
        self.opaque_roots.lock().insert(root);
    }

    /// Moves a marker's local opaque roots into the shared set.
    pub fn merge_opaque_roots(&self, local: &mut HashSet<usize>) {
        if local.is_empty() {
            return;
        }
        self.opaque_roots.lock().extend(local.drain());
    }

    /// Whether `root` was declared live by any merged marker.
    #[must_use]
    pub fn contains_opaque_root(&self, root: usize) -> bool {
        self.opaque_roots.lock().contains(&root)
    }

    /// Number of distinct merged opaque roots.
    #[must_use]
    pub fn opaque_root_count(&self) -> usize {
        self.opaque_roots.lock().len()
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    pub(crate) fn add_counts(&self, visits: usize, visited: usize, copied: usize, extra: usize) {
        self.visit_count.fetch_add(visits, Ordering::Relaxed);
        self.bytes_visited.fetch_add(visited, Ordering::Relaxed);
        self.bytes_copied.fetch_add(copied, Ordering::Relaxed);
        self.extra_memory_visited.fetch_add(extra, Ordering::Relaxed);
    }

    /// Cells visited this mark phase, over all markers.
    #[must_use]
    pub fn visit_count(&self) -> usize {
        self.visit_count.load(Ordering::Relaxed)
    }

    /// Cell bytes visited this mark phase.
    #[must_use]
    pub fn bytes_visited(&self) -> usize {
        self.bytes_visited.load(Ordering::Relaxed)
    }

    /// Backing-store bytes reported live this mark phase.
    #[must_use]
    pub fn bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Off-heap bytes reported by visited cells.
    #[must_use]
    pub fn extra_memory_visited(&self) -> usize {
        self.extra_memory_visited.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SharedMarkingData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMarkingData")
            .field("number_of_markers", &self.number_of_markers)
            .field("visit_count", &self.visit_count())
            .field("bytes_visited", &self.bytes_visited())
            .finish_non_exhaustive()
    }
}
