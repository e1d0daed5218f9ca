//! Weak handles, weak-handle owners, harvesters and unconditional finalizers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use gengc::{
    Cell, CellPtr, CollectionRequest, Heap, HeapConfig, SlotVisitor, Strong, Trace,
    UnconditionalFinalizer, Weak, WeakHandleOwner, WeakReferenceHarvester, WriteBarrier,
};

#[derive(Trace, Cell)]
struct Leaf {
    value: u32,
}

#[derive(Trace, Cell)]
struct Holder {
    slot: WriteBarrier,
}

fn heap() -> Heap {
    Heap::new(HeapConfig::default().with_number_of_markers(1))
}

// ============================================================================
// Weak handles
// ============================================================================

#[test]
fn test_weak_handle_is_cleared_when_referent_dies() {
    let heap = heap();
    let weak = Weak::new(&heap, heap.allocate(Leaf { value: 1 }));
    assert!(!weak.is_cleared());

    heap.collect_all_garbage();
    assert!(weak.is_cleared());
    assert_eq!(heap.last_gc_metrics().weak_handles_cleared, 1);
}

#[test]
fn test_weak_handle_follows_live_referent() {
    let heap = heap();
    let strong = Strong::new(&heap, heap.allocate(Leaf { value: 9 }));
    let weak = Weak::new(&heap, strong.cell());

    heap.collect_all_garbage();
    let cell = weak.get().expect("referent is strongly held");
    // SAFETY: `strong` keeps the cell alive.
    assert_eq!(unsafe { cell.get() }.value, 9);

    drop(strong);
    heap.collect_all_garbage();
    assert!(weak.get().is_none());
}

#[test]
fn test_weak_handle_slots_are_released_on_drop() {
    let heap = heap();
    let cell = heap.allocate(Leaf { value: 0 });
    let a = Weak::new(&heap, cell);
    let b = Weak::new(&heap, cell);
    assert_eq!(heap.weak_handle_count(), 2);
    drop(a);
    assert_eq!(heap.weak_handle_count(), 1);
    drop(b);
    assert_eq!(heap.weak_handle_count(), 0);
}

// ============================================================================
// Owners
// ============================================================================

/// A wrapper object that keeps a weakly held cell alive while it lives,
/// through an opaque root rather than a reference.
struct Wrapper {
    token: usize,
}

// SAFETY: holds no cell references.
unsafe impl Trace for Wrapper {
    fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
}

// SAFETY: `visit_children` reports no references.
unsafe impl Cell for Wrapper {
    fn visit_children(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.add_opaque_root(self.token);
    }
}

#[derive(Default)]
struct WrapperOwner {
    finalized: AtomicUsize,
    last_context: AtomicUsize,
}

impl WeakHandleOwner for WrapperOwner {
    fn is_reachable_from_opaque_roots(
        &self,
        _cell: CellPtr,
        context: usize,
        visitor: &SlotVisitor<'_>,
    ) -> bool {
        visitor.contains_opaque_root(context)
    }

    fn finalize(&self, _cell: CellPtr, context: usize) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        self.last_context.store(context, Ordering::SeqCst);
    }
}

#[test]
fn test_owner_rescues_referent_through_opaque_root() {
    let heap = heap();
    let owner = Arc::new(WrapperOwner::default());
    let wrapper = Strong::new(&heap, heap.allocate(Wrapper { token: 0xabc }));
    let weak = Weak::with_owner(&heap, heap.allocate(Leaf { value: 5 }), owner.clone(), 0xabc);

    heap.collect_all_garbage();
    assert!(!weak.is_cleared());
    assert_eq!(owner.finalized.load(Ordering::SeqCst), 0);

    drop(wrapper);
    heap.collect_all_garbage();
    assert!(weak.is_cleared());
    assert_eq!(owner.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(owner.last_context.load(Ordering::SeqCst), 0xabc);
}

#[test]
fn test_owner_finalizes_pending_slots_when_heap_drops() {
    let owner = Arc::new(WrapperOwner::default());
    {
        let heap = heap();
        let cell = heap.allocate(Leaf { value: 1 });
        heap.protect(cell);
        let weak = Weak::with_owner(&heap, cell, owner.clone(), 7);
        std::mem::forget(weak);
    }
    assert_eq!(owner.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(owner.last_context.load(Ordering::SeqCst), 7);
}

// ============================================================================
// Harvesters
// ============================================================================

/// Strengthens `target` only while `flag` is set, and records whether the
/// strongly held `witness` was already marked when it first ran.
struct FlagHarvester {
    flag: AtomicBool,
    target: AtomicUsize,
    witness: AtomicUsize,
    saw_witness_marked: AtomicBool,
    runs: AtomicUsize,
}

impl FlagHarvester {
    fn new(target: CellPtr, witness: CellPtr) -> Self {
        Self {
            flag: AtomicBool::new(false),
            target: AtomicUsize::new(target.addr()),
            witness: AtomicUsize::new(witness.addr()),
            saw_witness_marked: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        }
    }
}

impl WeakReferenceHarvester for FlagHarvester {
    fn visit_weak_references(&self, visitor: &mut SlotVisitor<'_>) {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            let witness = CellPtr::from_addr(self.witness.load(Ordering::SeqCst))
                .expect("witness address");
            self.saw_witness_marked
                .store(visitor.is_marked(witness), Ordering::SeqCst);
        }
        if !self.flag.load(Ordering::SeqCst) {
            return;
        }
        if let Some(target) = CellPtr::from_addr(self.target.load(Ordering::SeqCst)) {
            visitor.append(target);
        }
    }
}

fn run_flag_scenario(flag: bool) -> bool {
    let heap = heap();
    // A chain keeps the witness reachable only through marking.
    let witness = heap.allocate(Leaf { value: 0 });
    let root = Strong::new(
        &heap,
        heap.allocate(Holder {
            slot: WriteBarrier::new(witness.into()),
        }),
    );
    let target = heap.allocate(Leaf { value: 1 });
    let weak = Weak::new(&heap, target);

    let harvester = Arc::new(FlagHarvester::new(target.as_cell(), witness.as_cell()));
    harvester.flag.store(flag, Ordering::SeqCst);
    heap.add_weak_reference_harvester(harvester.clone());

    heap.collect(CollectionRequest::Full);
    assert!(
        harvester.saw_witness_marked.load(Ordering::SeqCst),
        "harvester ran before strong marking converged"
    );
    assert!(harvester.runs.load(Ordering::SeqCst) >= 1);
    drop(root);
    !weak.is_cleared()
}

#[test]
fn test_harvester_with_flag_unset_lets_referent_die() {
    assert!(!run_flag_scenario(false));
}

#[test]
fn test_harvester_with_flag_set_keeps_referent() {
    assert!(run_flag_scenario(true));
}

/// A harvester that strengthens a chain one link per run, so the weak loop
/// has to iterate to a fixpoint.
struct ChainHarvester {
    links: Vec<usize>,
}

impl WeakReferenceHarvester for ChainHarvester {
    fn visit_weak_references(&self, visitor: &mut SlotVisitor<'_>) {
        for window in self.links.windows(2) {
            let (from, to) = (window[0], window[1]);
            let from = CellPtr::from_addr(from).expect("link address");
            let to = CellPtr::from_addr(to).expect("link address");
            if visitor.is_marked(from) && !visitor.is_marked(to) {
                visitor.append(to);
                return;
            }
        }
    }
}

#[test]
fn test_weak_loop_runs_to_fixpoint() {
    let heap = heap();
    let cells: Vec<_> = (0..5).map(|value| heap.allocate(Leaf { value })).collect();
    let _head = Strong::new(&heap, cells[0]);
    heap.add_weak_reference_harvester(Arc::new(ChainHarvester {
        links: cells.iter().map(|cell| cell.as_cell().addr()).collect(),
    }));

    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 5);
}

/// A cell that registers a per-cycle harvester every time it is visited.
struct SelfRegistering {
    harvester: Arc<CountingHarvester>,
}

#[derive(Default)]
struct CountingHarvester {
    runs: AtomicUsize,
}

impl WeakReferenceHarvester for CountingHarvester {
    fn visit_weak_references(&self, _visitor: &mut SlotVisitor<'_>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

// SAFETY: holds no cell references.
unsafe impl Trace for SelfRegistering {
    fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
}

// SAFETY: `visit_children` reports no references.
unsafe impl Cell for SelfRegistering {
    fn visit_children(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.add_weak_reference_harvester(self.harvester.clone());
    }
}

#[test]
fn test_per_cycle_harvesters_are_deduplicated_and_dropped() {
    let heap = heap();
    let harvester = Arc::new(CountingHarvester::default());
    let first = heap.allocate(SelfRegistering {
        harvester: harvester.clone(),
    });
    let second = heap.allocate(SelfRegistering {
        harvester: harvester.clone(),
    });
    heap.protect(first);
    heap.protect(second);

    heap.collect(CollectionRequest::Full);
    // Registered twice, run once per weak-loop round; nothing strengthened,
    // so there is exactly one round.
    assert_eq!(harvester.runs.load(Ordering::SeqCst), 1);

    heap.unprotect(first);
    heap.unprotect(second);
    heap.collect(CollectionRequest::Full);
    assert_eq!(harvester.runs.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Unconditional finalizers
// ============================================================================

/// Clears a cache slot whose referent did not survive.
struct CacheFinalizer {
    entry: AtomicUsize,
    cleared: AtomicBool,
}

impl UnconditionalFinalizer for CacheFinalizer {
    fn finalize_unconditionally(&self, heap: &Heap) {
        let Some(cell) = CellPtr::from_addr(self.entry.load(Ordering::SeqCst)) else {
            return;
        };
        if !heap.is_marked(cell) {
            self.entry.store(0, Ordering::SeqCst);
            self.cleared.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_unconditional_finalizer_sees_final_marks() {
    let heap = heap();
    let cached = heap.allocate(Leaf { value: 3 });
    let finalizer = Arc::new(CacheFinalizer {
        entry: AtomicUsize::new(cached.as_cell().addr()),
        cleared: AtomicBool::new(false),
    });
    heap.add_unconditional_finalizer(finalizer.clone());

    let root = Strong::new(&heap, cached);
    heap.collect(CollectionRequest::Full);
    assert!(!finalizer.cleared.load(Ordering::SeqCst));

    drop(root);
    heap.collect(CollectionRequest::Full);
    assert!(finalizer.cleared.load(Ordering::SeqCst));
    assert_eq!(finalizer.entry.load(Ordering::SeqCst), 0);
}
