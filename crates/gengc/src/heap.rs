//! The heap: allocation entry points and the collection cycle.
//!
//! A collection moves the heap from [`HeapOperation::NoOperation`] into an
//! eden or full collection and back. Only one thread runs a cycle at a
//! time; other threads that allocate, sweep or root a cell wait until it
//! ends. The object space lock is held only around the phases that touch
//! the space itself, so collector callbacks may query the heap. A cycle
//! runs these phases in order:
//!
//! 1. Stop allocation: park compiler worklists, maybe discard code, reset
//!    or snapshot the remembered set, freeze both spaces, clear marks.
//! 2. Mark: conservative roots, precise roots, the remembered snapshot and
//!    live code, then convergence of every marker, then the weak loop.
//! 3. Reap weak handles whose referents died.
//! 4. Copy backing stores out of sparse copying-space blocks.
//! 5. Finalize: unconditional finalizers, dead plans, unmarked code.
//! 6. Sweep: hand the sweeper its snapshot, resize for the next cycle and
//!    resume the worklists.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;

use crate::cell::{class_info, Cell, CellBox, CellHeader, CellPtr, CellRef, Value};
use crate::compiler::{CodeDiscardPolicy, CodeRegistry, CompilerWorklist};
use crate::config::HeapConfig;
use crate::gc::sync::{LockOrder, OrderedMutex, OrderedMutexGuard};
use crate::gc::{
    ConservativeRoots, HeapRootVisitor, RememberedSet, SharedMarkingData, SlotVisitor,
};
use crate::handles::RootTables;
use crate::limits::HeapLimits;
use crate::metrics::{GcHistory, GcMetrics, HeapStatistics, PhaseTimer};
use crate::roots::{
    ConservativeRootSource, RootProvider, UnconditionalFinalizer, WeakReferenceHarvester,
};
use crate::space::block::CELL_ALIGNMENT;
use crate::space::copied::{storage_size, CopiedSpace, CopyPlan, CopyVisitor};
use crate::space::marked_space::{CellIndex, MarkedSpace};
use crate::trace::Trace;
use crate::tracing::internal::{self as trace, GcPhase};

/// Scope of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Young cells only; old cells are kept through their marks and the
    /// remembered set stands in for old-to-young references.
    Eden,
    /// The whole heap from scratch.
    Full,
}

/// What a caller asks [`Heap::collect`] for.
///
/// The heuristics may escalate a request to a full collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionRequest {
    /// Let the heuristics decide.
    #[default]
    Any,
    /// Prefer an eden collection.
    Eden,
    /// Always a full collection.
    Full,
}

/// What the heap is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapOperation {
    /// Mutators may run.
    NoOperation = 0,
    /// An eden collection is in progress.
    EdenCollection = 1,
    /// A full collection is in progress.
    FullCollection = 2,
}

impl HeapOperation {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::EdenCollection,
            2 => Self::FullCollection,
            _ => Self::NoOperation,
        }
    }
}

impl From<CollectionKind> for HeapOperation {
    fn from(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Eden => Self::EdenCollection,
            CollectionKind::Full => Self::FullCollection,
        }
    }
}

/// Collaborators registered for every cycle.
#[derive(Default, Clone)]
struct Collaborators {
    root_providers: Vec<Arc<dyn RootProvider>>,
    conservative_sources: Vec<Arc<dyn ConservativeRootSource>>,
    harvesters: Vec<Arc<dyn WeakReferenceHarvester>>,
    finalizers: Vec<Arc<dyn UnconditionalFinalizer>>,
    worklists: Vec<Arc<dyn CompilerWorklist>>,
    code: Vec<Arc<dyn CodeRegistry>>,
}

fn remove_arc<T: ?Sized>(list: &mut Vec<Arc<T>>, item: &Arc<T>) -> bool {
    let before = list.len();
    list.retain(|existing| !Arc::ptr_eq(existing, item));
    list.len() != before
}

/// A garbage-collected heap.
///
/// # Example
///
/// ```
/// use gengc::{Heap, HeapConfig, Strong};
///
/// let heap = Heap::new(HeapConfig::default().with_number_of_markers(1));
/// let kept = Strong::allocate(&heap, 1u64);
/// for i in 0..100u64 {
///     heap.allocate(i);
/// }
/// heap.collect_all_garbage();
/// assert_eq!(heap.object_count(), 1);
/// assert_eq!(*kept, 1);
/// ```
pub struct Heap {
    config: HeapConfig,
    objects: OrderedMutex<MarkedSpace>,
    cells: Arc<CellIndex>,
    storage: CopiedSpace,
    remembered: RememberedSet,
    root_tables: OrderedMutex<RootTables>,
    collaborators: OrderedMutex<Collaborators>,
    shared: SharedMarkingData,
    limits: Mutex<HeapLimits>,
    code_discard: Mutex<CodeDiscardPolicy>,
    operation: AtomicU8,
    defer_depth: AtomicUsize,
    collection_lock: Mutex<()>,
    collector: Mutex<Option<ThreadId>>,
    statistics: HeapStatistics,
    history: GcHistory,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        let objects = MarkedSpace::new(config.zombie_mode);
        let cells = Arc::clone(objects.cells());
        Self {
            objects: OrderedMutex::new(LockOrder::ObjectSpace, objects),
            cells,
            storage: CopiedSpace::new(
                config.min_heap_utilization,
                config.min_copied_block_utilization,
            ),
            remembered: RememberedSet::new(),
            root_tables: OrderedMutex::new(LockOrder::RootTables, RootTables::new()),
            collaborators: OrderedMutex::with_default(LockOrder::RootTables),
            shared: SharedMarkingData::new(config.markers()),
            limits: Mutex::new(HeapLimits::new(&config)),
            code_discard: Mutex::new(CodeDiscardPolicy::new(config.code_discard_interval)),
            operation: AtomicU8::new(HeapOperation::NoOperation as u8),
            defer_depth: AtomicUsize::new(0),
            collection_lock: Mutex::new(()),
            collector: Mutex::new(None),
            statistics: HeapStatistics::new(),
            history: GcHistory::new(),
            config,
        }
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Moves `value` into a new cell.
    ///
    /// May collect first. `value` is treated as a root by that collection,
    /// so cells it references survive even if nothing else holds them. The
    /// returned cell is not rooted: a collection started by another thread
    /// may free it before it is stored or rooted. Threads sharing a heap use
    /// [`Strong::allocate`](crate::Strong::allocate) or
    /// [`HandleScope::allocate`](crate::HandleScope::allocate) instead.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a collector callback.
    pub fn allocate<T: Cell>(&self, value: T) -> CellRef<T> {
        self.allocate_and(value, |_| ()).0
    }

    /// Allocates `value` and roots it through `root` before any collection
    /// can start.
    pub(crate) fn allocate_rooted<T: Cell, R>(
        &self,
        value: T,
        root: impl FnOnce(&mut RootTables, CellPtr) -> R,
    ) -> (CellRef<T>, R) {
        self.allocate_and(value, |cell| root(&mut self.root_tables.lock(), cell))
    }

    fn allocate_and<T: Cell, R>(&self, value: T, then: impl FnOnce(CellPtr) -> R) -> (CellRef<T>, R) {
        const {
            assert!(
                align_of::<CellBox<T>>() <= CELL_ALIGNMENT,
                "cell types may not be aligned beyond 16 bytes"
            );
        }
        self.assert_not_collecting_thread();
        self.collect_if_necessary_with(Some(&value));

        let mut objects = self.lock_objects();
        let (ptr, cell_size) = objects.allocate(size_of::<CellBox<T>>());
        let boxed = ptr.cast::<CellBox<T>>();
        // SAFETY: the space handed out `cell_size >= size_of::<CellBox<T>>()`
        // suitably aligned bytes; nothing reads the cell before this write.
        unsafe {
            boxed.as_ptr().write(CellBox {
                header: CellHeader::new(class_info::<T>()),
                value,
            });
        }
        let cell = CellRef::from_box(boxed);
        let result = then(cell.as_cell());
        drop(objects);
        self.limits.lock().did_allocate(cell_size);
        (cell, result)
    }

    /// Allocates `len` zeroed bytes in the copying space.
    ///
    /// Never collects: the storage is not reported by any cell yet.
    pub fn allocate_storage(&self, len: usize) -> NonNull<u8> {
        let ptr = self.storage.allocate(len);
        self.limits.lock().did_allocate(storage_size(len.max(1)));
        ptr
    }

    /// Accounts `bytes` of off-heap memory owned by live cells.
    ///
    /// Brings the next collection forward when the budget runs out.
    pub fn report_extra_memory_cost(&self, bytes: usize) {
        self.limits.lock().report_extra_memory(bytes);
        self.collect_if_necessary_or_defer();
    }

    fn assert_not_collecting_thread(&self) {
        assert!(
            !self.is_busy() || !self.is_collector_thread(),
            "allocation from inside a collection"
        );
    }

    fn is_collector_thread(&self) -> bool {
        *self.collector.lock() == Some(std::thread::current().id())
    }

    /// Locks the object space, first waiting out a collection run by
    /// another thread.
    fn lock_objects(&self) -> OrderedMutexGuard<'_, MarkedSpace> {
        loop {
            let objects = self.objects.lock();
            if !self.is_busy() || self.is_collector_thread() {
                return objects;
            }
            drop(objects);
            drop(self.collection_lock.lock());
        }
    }

    /// Whether `cell` is an allocated cell of this heap that is still alive.
    ///
    /// During a collection only marked cells count.
    fn is_live_cell(&self, objects: &MarkedSpace, cell: CellPtr) -> bool {
        if self.is_busy() {
            objects
                .cell_for_candidate(cell.addr())
                .is_some_and(|(block, index)| block.is_marked(index))
        } else {
            objects.live_cell(cell.addr()).is_some()
        }
    }

    /// Runs `root` on the root tables once `cell` is known to be a live
    /// `T` of this heap. No collection starts until `root` returns.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is not a live cell of this heap, or not a `T`.
    pub(crate) fn root<T: Cell, R>(
        &self,
        cell: CellRef<T>,
        root: impl FnOnce(&mut RootTables, CellPtr) -> R,
    ) -> R {
        let objects = self.lock_objects();
        let ptr = cell.as_cell();
        let valid = self.is_live_cell(&objects, ptr)
            // SAFETY: a live cell of this heap has an initialized header.
            && unsafe { ptr.downcast::<T>() }.is_some();
        assert!(
            valid,
            "{ptr:?} is not a live {} of this heap",
            std::any::type_name::<T>()
        );
        let mut tables = self.root_tables.lock();
        let result = root(&mut tables, ptr);
        drop(tables);
        drop(objects);
        result
    }

    // ------------------------------------------------------------------------
    // Roots and barriers
    // ------------------------------------------------------------------------

    /// Keeps `cell` alive regardless of reachability. Reference counted.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is not a live cell of this heap.
    pub fn protect(&self, cell: impl Into<CellPtr>) {
        let cell = cell.into();
        let objects = self.lock_objects();
        assert!(
            self.is_live_cell(&objects, cell),
            "protect() of {cell:?}, which is not a live cell of this heap"
        );
        self.root_tables.lock().protect(cell);
        drop(objects);
    }

    /// Drops one protection of `cell`. Returns `true` once none is left.
    pub fn unprotect(&self, cell: impl Into<CellPtr>) -> bool {
        self.root_tables.lock().unprotect(cell.into())
    }

    /// The generational write barrier for storing `value` into `owner`.
    ///
    /// Only cell values matter: an old owner now referencing a cell is
    /// recorded in the remembered set. An `owner` that is not a live cell
    /// of this heap is ignored.
    #[inline]
    pub fn write_barrier(&self, owner: CellPtr, value: Value) {
        if !self.config.enable_generational || !value.is_cell() {
            return;
        }
        self.remember(owner, RememberedSet::write_barrier);
    }

    /// The write barrier for a store whose value is not at hand, such as a
    /// replaced backing store.
    #[inline]
    pub fn write_barrier_for(&self, owner: CellPtr) {
        if !self.config.enable_generational {
            return;
        }
        self.remember(owner, RememberedSet::write_barrier);
    }

    /// Records `cell` for rescanning by the next eden collection.
    ///
    /// Ignored unless `cell` is a live cell of this heap.
    pub fn add_to_remembered_set(&self, cell: impl Into<CellPtr>) {
        if self.config.enable_generational {
            self.remember(cell.into(), RememberedSet::add_to_remembered_set);
        }
    }

    fn remember(&self, owner: CellPtr, record: impl FnOnce(&RememberedSet, CellPtr)) {
        let objects = self.objects.lock();
        if self.is_live_cell(&objects, owner) {
            record(&self.remembered, owner);
        }
    }

    /// Moves buffered barrier entries into the remembered set.
    pub fn flush_write_barrier_buffer(&self) {
        self.remembered.flush();
    }

    /// Whether `cell` is marked.
    ///
    /// Meaningful for finalizers and harvesters during a collection, and
    /// for old cells between collections. Anything that is not an allocated
    /// cell of this heap reads as unmarked.
    #[must_use]
    pub fn is_marked(&self, cell: impl Into<CellPtr>) -> bool {
        self.cells
            .with_cell(cell.into().addr(), |block, index| block.is_marked(index))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------------

    /// Registers a source of precise roots.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.collaborators.lock().root_providers.push(provider);
    }

    /// Unregisters a source of precise roots.
    pub fn remove_root_provider(&self, provider: &Arc<dyn RootProvider>) -> bool {
        remove_arc(&mut self.collaborators.lock().root_providers, provider)
    }

    /// Registers a raw-memory region scanned conservatively.
    pub fn add_conservative_root_source(&self, source: Arc<dyn ConservativeRootSource>) {
        self.collaborators.lock().conservative_sources.push(source);
    }

    /// Unregisters a raw-memory region.
    pub fn remove_conservative_root_source(
        &self,
        source: &Arc<dyn ConservativeRootSource>,
    ) -> bool {
        remove_arc(&mut self.collaborators.lock().conservative_sources, source)
    }

    /// Registers a harvester run in every collection's weak loop.
    pub fn add_weak_reference_harvester(&self, harvester: Arc<dyn WeakReferenceHarvester>) {
        self.collaborators.lock().harvesters.push(harvester);
    }

    /// Registers a finalizer run after every collection's marking.
    pub fn add_unconditional_finalizer(&self, finalizer: Arc<dyn UnconditionalFinalizer>) {
        self.collaborators.lock().finalizers.push(finalizer);
    }

    /// Registers a compiler worklist to suspend during collections.
    pub fn add_compiler_worklist(&self, worklist: Arc<dyn CompilerWorklist>) {
        self.collaborators.lock().worklists.push(worklist);
    }

    /// Registers a set of compiled code blocks.
    pub fn add_code_registry(&self, code: Arc<dyn CodeRegistry>) {
        self.collaborators.lock().code.push(code);
    }

    // ------------------------------------------------------------------------
    // Deferral
    // ------------------------------------------------------------------------

    pub(crate) fn increment_defer_depth(&self) {
        self.defer_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_defer_depth(&self) {
        let previous = self.defer_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced deferral depth");
    }

    /// Whether a [`DeferGc`](crate::DeferGc) guard is alive.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.defer_depth.load(Ordering::Acquire) > 0
    }

    // ------------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------------

    /// What the heap is doing right now.
    #[must_use]
    pub fn operation(&self) -> HeapOperation {
        HeapOperation::from_u8(self.operation.load(Ordering::Acquire))
    }

    /// Whether a collection is in progress.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.operation() != HeapOperation::NoOperation
    }

    /// Collects if the heuristics ask for it and nothing defers collection.
    pub fn collect_if_necessary_or_defer(&self) {
        self.collect_if_necessary_with(None);
    }

    fn collect_if_necessary_with(&self, in_flight: Option<&dyn Trace>) {
        if self.is_deferred() || self.is_busy() {
            return;
        }
        if !self.limits.lock().should_collect() {
            return;
        }
        self.collect_impl(CollectionRequest::Any, in_flight, true);
    }

    /// Runs one collection. Returns the kind that actually ran.
    ///
    /// # Panics
    ///
    /// Panics if collection is deferred or re-entered from a collector
    /// callback.
    pub fn collect(&self, request: CollectionRequest) -> CollectionKind {
        self.collect_impl(request, None, false)
            .unwrap_or(CollectionKind::Full)
    }

    /// A full collection, then an eager sweep and shrink of both spaces.
    pub fn collect_all_garbage(&self) {
        self.collect(CollectionRequest::Full);
        let mut objects = self.lock_objects();
        objects.sweep_all();
        objects.shrink();
        drop(objects);
        self.storage.shrink();
    }

    fn collect_impl(
        &self,
        request: CollectionRequest,
        in_flight: Option<&dyn Trace>,
        only_if_necessary: bool,
    ) -> Option<CollectionKind> {
        assert!(!self.is_deferred(), "collect() while collection is deferred");
        let me = std::thread::current().id();
        assert_ne!(
            *self.collector.lock(),
            Some(me),
            "collection re-entered from inside a collection"
        );

        let serial = self.collection_lock.lock();
        if only_if_necessary && !self.limits.lock().should_collect() {
            return None;
        }
        assert_eq!(
            self.operation(),
            HeapOperation::NoOperation,
            "collection started while another is in progress"
        );
        let kind = self.limits.lock().collection_kind(request);
        *self.collector.lock() = Some(me);
        self.operation
            .store(HeapOperation::from(kind) as u8, Ordering::Release);

        let metrics = self.run_cycle(kind, in_flight);

        self.statistics.record(
            &metrics,
            self.objects.lock().committed_bytes(),
            self.storage.committed_bytes(),
        );
        self.history.push(metrics);
        self.operation
            .store(HeapOperation::NoOperation as u8, Ordering::Release);
        *self.collector.lock() = None;
        drop(serial);
        Some(kind)
    }

    #[allow(clippy::too_many_lines, clippy::let_unit_value)]
    fn run_cycle(&self, kind: CollectionKind, in_flight: Option<&dyn Trace>) -> GcMetrics {
        let start = Instant::now();
        let gc_id = trace::next_gc_id();
        let _span = trace::trace_gc_collection(kind, gc_id);
        let collaborators = self.collaborators.lock().clone();
        let bytes_before = {
            let limits = self.limits.lock();
            limits.size_after_last_collect() + limits.bytes_allocated_this_cycle()
        };
        let mut timer = PhaseTimer::new();

        // Stop allocation.
        let snapshot = {
            let _phase = trace::trace_phase(GcPhase::StopAllocation);
            self.log_phase_start(GcPhase::StopAllocation, bytes_before);
            for worklist in &collaborators.worklists {
                worklist.request_suspension();
            }
            for worklist in &collaborators.worklists {
                worklist.wait_for_suspension();
            }
            if kind == CollectionKind::Full
                && !collaborators.code.is_empty()
                && self.code_discard.lock().should_discard(Instant::now())
            {
                for code in &collaborators.code {
                    code.clear_code_if_not_compiling();
                }
            }
            let snapshot = match kind {
                CollectionKind::Full => {
                    self.remembered.clear();
                    Vec::new()
                }
                CollectionKind::Eden => self.remembered.take_snapshot(),
            };
            let mut objects = self.objects.lock();
            objects.stop_allocating();
            self.storage.stop_allocating();
            objects.clear_marks(kind);
            drop(objects);
            if kind == CollectionKind::Full {
                for code in &collaborators.code {
                    code.clear_marks();
                }
            }
            snapshot
        };

        // Mark.
        timer.start();
        let mut visitor = SlotVisitor::new(self, kind);
        let conservative_roots = {
            let _phase = trace::trace_phase(GcPhase::MarkRoots);
            self.log_phase_start(GcPhase::MarkRoots, bytes_before);
            self.shared.did_start_marking();

            let mut roots = ConservativeRoots::new(&self.cells, &self.storage);
            if self.config.scan_native_stack {
                crate::stack::gather_from_current_thread(&mut roots);
            }
            for source in &collaborators.conservative_sources {
                source.gather_conservative_roots(&mut roots);
            }
            if self.config.verbose {
                trace::log_conservative_roots(
                    roots.len(),
                    roots.words_scanned(),
                    roots.pinned_count(),
                );
            }
            visitor.append_conservative_roots(&roots);
            let found = roots.len();
            drop(roots);

            self.root_tables
                .lock()
                .for_each_strong_root(|cell| visitor.append(cell));
            if !collaborators.root_providers.is_empty() {
                let mut precise = HeapRootVisitor::new(&mut visitor);
                for provider in &collaborators.root_providers {
                    provider.visit_roots(&mut precise);
                }
            }
            if let Some(value) = in_flight {
                visitor.append_trace(value);
            }
            for &cell in &snapshot {
                visitor.unconditionally_append(cell);
            }
            for code in &collaborators.code {
                code.visit_live_code(&mut visitor);
            }
            visitor.converge();
            self.resolve_weak_references(&mut visitor, &collaborators);
            if self.config.objects_are_immortal {
                let allocated = self.objects.lock().allocated_cells();
                for cell in allocated {
                    visitor.append(cell);
                }
                visitor.converge();
            }
            visitor.flush();
            debug_assert!(visitor.is_empty());
            drop(visitor);
            if kind == CollectionKind::Eden {
                RememberedSet::did_finish_marking(&snapshot);
            }
            found
        };
        timer.end_mark();

        let weak_handles_cleared = {
            let _phase = trace::trace_phase(GcPhase::ReapWeakHandles);
            let (pending, cleared) = self.root_tables.lock().reap_weak();
            for finalizer in pending {
                finalizer.run();
            }
            cleared
        };

        timer.start();
        let plan = {
            let _phase = trace::trace_phase(GcPhase::CopyBackingStores);
            let plan = self.storage.started_copying(kind);
            if self.config.verbose {
                trace::log_copy_plan(plan.should_copy, plan.blocks_to_copy, plan.utilization);
            }
            if plan.should_copy && plan.blocks_to_copy > 0 {
                self.copy_backing_stores();
            }
            self.storage.done_copying();
            plan
        };
        timer.end_copy();

        timer.start();
        {
            let _phase = trace::trace_phase(GcPhase::Finalize);
            for finalizer in &collaborators.finalizers {
                finalizer.finalize_unconditionally(self);
            }
            for finalizer in self.shared.unconditional_finalizers() {
                finalizer.finalize_unconditionally(self);
            }
            for worklist in &collaborators.worklists {
                worklist.remove_dead_plans(self);
            }
            for code in &collaborators.code {
                code.delete_unmarked_code(self);
            }
            self.shared.did_finish_marking();
        }
        timer.end_finalize();

        let bytes_after = {
            let _phase = trace::trace_phase(GcPhase::Sweep);
            let mut objects = self.objects.lock();
            objects.clear_newly_allocated();
            objects.snapshot(kind);
            objects.reset_allocators();
            drop(objects);
            self.update_limits(kind)
        };

        for worklist in &collaborators.worklists {
            worklist.resume();
        }

        let duration = start.elapsed();
        self.log_phase_end(GcPhase::Sweep, bytes_after);
        if self.config.log_gc {
            trace::log_collection_summary(kind, bytes_before, bytes_after, duration);
        }
        GcMetrics {
            duration,
            collection_type: kind.into(),
            bytes_before,
            bytes_after,
            visit_count: self.shared.visit_count(),
            bytes_visited: self.shared.bytes_visited(),
            bytes_copied: self.shared.bytes_copied(),
            conservative_roots,
            weak_handles_cleared,
            mark_duration: timer.mark,
            copy_duration: timer.copy,
            finalize_duration: timer.finalize,
            copied: copied_anything(&plan),
            total_collections: self.statistics.total_collections() + 1,
        }
    }

    /// Runs harvesters and weak owners until they stop producing work.
    fn resolve_weak_references(&self, visitor: &mut SlotVisitor<'_>, collaborators: &Collaborators) {
        loop {
            let before = visitor.visit_count();
            let candidates = self.root_tables.lock().unmarked_owned_weak();
            for (cell, owner, context) in candidates {
                if owner.is_reachable_from_opaque_roots(cell, context, visitor) {
                    visitor.append(cell);
                }
            }
            for harvester in &collaborators.harvesters {
                harvester.visit_weak_references(visitor);
            }
            for harvester in self.shared.weak_reference_harvesters() {
                harvester.visit_weak_references(visitor);
            }
            for worklist in &collaborators.worklists {
                worklist.visit_weak_references(visitor);
            }
            if visitor.is_empty() && visitor.visit_count() == before {
                return;
            }
            visitor.converge();
        }
    }

    /// Evacuates the blocks the copying space queued, one copy visitor per
    /// marker thread.
    fn copy_backing_stores(&self) {
        let helpers = self.shared.number_of_markers() - 1;
        std::thread::scope(|scope| {
            for _ in 0..helpers {
                scope.spawn(|| self.run_copy_visitor());
            }
            self.run_copy_visitor();
        });
    }

    fn run_copy_visitor(&self) {
        let mut visitor = CopyVisitor::new(&self.storage);
        visitor.start_copying();
        visitor.copy_from_shared();
        visitor.done_copying();
    }

    /// Recomputes the next cycle's trigger sizes. Aborts past the ceiling.
    fn update_limits(&self, kind: CollectionKind) -> usize {
        let mut limits = self.limits.lock();
        let size = limits.record_marked_bytes(
            kind,
            self.shared.bytes_visited(),
            self.shared.bytes_copied(),
            self.shared.extra_memory_visited(),
        );
        limits.did_collect(kind, size);
        if self.config.verbose {
            trace::log_heuristics(
                limits.max_heap_size(),
                limits.max_eden_size(),
                limits.should_do_full(),
            );
        }
        if limits.exceeds_ceiling(size) {
            trace::log_ceiling_exceeded(size, limits.ceiling().unwrap_or(0));
            std::process::abort();
        }
        size
    }

    fn log_phase_start(&self, phase: GcPhase, bytes: usize) {
        if self.config.verbose {
            trace::log_phase_start(phase, bytes);
        }
    }

    fn log_phase_end(&self, phase: GcPhase, bytes: usize) {
        if self.config.verbose {
            trace::log_phase_end(phase, bytes);
        }
    }

    // ------------------------------------------------------------------------
    // Sweeping
    // ------------------------------------------------------------------------

    /// Sweeps one block left by the last collection.
    ///
    /// Returns `false` once every block is swept.
    pub fn sweep_next_block(&self) -> bool {
        self.lock_objects().sweep_next_block()
    }

    /// Whether the last collection's blocks are all swept.
    #[must_use]
    pub fn is_sweeping_done(&self) -> bool {
        self.objects.lock().is_sweeping_done()
    }

    // ------------------------------------------------------------------------
    // Accessors for the collector's own modules
    // ------------------------------------------------------------------------

    pub(crate) const fn marking_data(&self) -> &SharedMarkingData {
        &self.shared
    }

    pub(crate) const fn storage(&self) -> &CopiedSpace {
        &self.storage
    }

    pub(crate) const fn root_tables(&self) -> &OrderedMutex<RootTables> {
        &self.root_tables
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Live cells.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().object_count()
    }

    /// Bytes held by live cells and by copying-space storage.
    #[must_use]
    pub fn size(&self) -> usize {
        self.objects.lock().size() + self.storage.size()
    }

    /// Bytes of block memory in use by both spaces.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.objects.lock().capacity() + self.storage.capacity()
    }

    /// Object-space blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.cells.len()
    }

    /// Copying-space blocks and oversize regions.
    #[must_use]
    pub fn storage_block_count(&self) -> usize {
        self.storage.block_count() + self.storage.oversize_count()
    }

    /// Strong handles alive.
    #[must_use]
    pub fn strong_handle_count(&self) -> usize {
        self.root_tables.lock().strong.len()
    }

    /// Weak handles alive, cleared or not.
    #[must_use]
    pub fn weak_handle_count(&self) -> usize {
        self.root_tables.lock().weak.len()
    }

    /// Distinct protected cells.
    #[must_use]
    pub fn protected_count(&self) -> usize {
        self.root_tables.lock().protected.len()
    }

    /// Cells in the remembered set, buffered entries included.
    #[must_use]
    pub fn remembered_count(&self) -> usize {
        self.remembered.len() + self.remembered.buffered()
    }

    /// A copy of the trigger sizes.
    #[must_use]
    pub fn limits(&self) -> HeapLimits {
        self.limits.lock().clone()
    }

    /// Metrics of the last collection, zeroed if none ran.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        self.history
            .recent(1)
            .first()
            .copied()
            .unwrap_or_default()
    }

    /// Recent collections.
    #[must_use]
    pub const fn history(&self) -> &GcHistory {
        &self.history
    }

    /// Cumulative counters.
    #[must_use]
    pub const fn statistics(&self) -> &HeapStatistics {
        &self.statistics
    }
}

const fn copied_anything(plan: &CopyPlan) -> bool {
    plan.should_copy && plan.blocks_to_copy > 0
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let pending = self.root_tables.get_mut().clear_all_weak();
        for finalizer in pending {
            finalizer.run();
        }
        self.objects.get_mut().destroy_all_cells();
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("operation", &self.operation())
            .field("deferred", &self.is_deferred())
            .field("storage", &self.storage)
            .field("remembered", &self.remembered)
            .finish_non_exhaustive()
    }
}
