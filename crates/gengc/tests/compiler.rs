//! Compiler worklist suspension and code registry hooks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gengc::{
    CellPtr, CodeRegistry, CollectionRequest, CompilerWorklist, Heap, HeapConfig, SlotVisitor,
    SuspensionBarrier,
};

fn heap() -> Heap {
    Heap::new(HeapConfig::default().with_number_of_markers(1))
}

type Log = Arc<Mutex<Vec<String>>>;

/// Records the suspension protocol as seen by one worklist.
struct RecordingWorklist {
    name: &'static str,
    log: Log,
}

impl CompilerWorklist for RecordingWorklist {
    fn request_suspension(&self) {
        self.log.lock().push(format!("request {}", self.name));
    }

    fn wait_for_suspension(&self) {
        self.log.lock().push(format!("wait {}", self.name));
    }

    fn resume(&self) {
        self.log.lock().push(format!("resume {}", self.name));
    }

    fn remove_dead_plans(&self, _heap: &Heap) {
        self.log.lock().push(format!("remove {}", self.name));
    }
}

#[test]
fn test_suspension_is_two_phase_across_worklists() {
    let heap = heap();
    let log: Log = Arc::default();
    for name in ["a", "b"] {
        heap.add_compiler_worklist(Arc::new(RecordingWorklist {
            name,
            log: log.clone(),
        }));
    }

    heap.collect(CollectionRequest::Full);
    let log = log.lock();
    assert_eq!(
        *log,
        [
            "request a",
            "request b",
            "wait a",
            "wait b",
            "remove a",
            "remove b",
            "resume a",
            "resume b"
        ]
    );
}

/// A worklist backed by real compiler threads parked through a
/// [`SuspensionBarrier`], holding one plan that references a cell.
struct ThreadedWorklist {
    barrier: SuspensionBarrier,
    plan: AtomicUsize,
    plan_is_useful: AtomicBool,
    plans_removed: AtomicUsize,
}

impl ThreadedWorklist {
    fn new(plan: CellPtr, useful: bool) -> Self {
        Self {
            barrier: SuspensionBarrier::new(),
            plan: AtomicUsize::new(plan.addr()),
            plan_is_useful: AtomicBool::new(useful),
            plans_removed: AtomicUsize::new(0),
        }
    }
}

impl CompilerWorklist for ThreadedWorklist {
    fn request_suspension(&self) {
        self.barrier.request_suspension();
    }

    fn wait_for_suspension(&self) {
        self.barrier.wait_for_suspension();
    }

    fn resume(&self) {
        self.barrier.resume();
    }

    fn visit_weak_references(&self, visitor: &mut SlotVisitor<'_>) {
        if !self.plan_is_useful.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cell) = CellPtr::from_addr(self.plan.load(Ordering::SeqCst)) {
            visitor.append(cell);
        }
    }

    fn remove_dead_plans(&self, heap: &Heap) {
        let Some(cell) = CellPtr::from_addr(self.plan.load(Ordering::SeqCst)) else {
            return;
        };
        if !heap.is_marked(cell) {
            self.plan.store(0, Ordering::SeqCst);
            self.plans_removed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Checks that compiler threads stay parked while marking runs.
struct ProgressWatcher {
    progress: Arc<AtomicUsize>,
    frozen: AtomicBool,
}

impl CodeRegistry for ProgressWatcher {
    fn visit_live_code(&self, _visitor: &mut SlotVisitor<'_>) {
        let before = self.progress.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        self.frozen
            .store(self.progress.load(Ordering::SeqCst) == before, Ordering::SeqCst);
    }
}

#[test]
fn test_compiler_threads_are_parked_during_collection() {
    let heap = heap();
    let plan = heap.allocate(1u64);
    let worklist = Arc::new(ThreadedWorklist::new(plan.as_cell(), true));
    let progress = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    heap.add_compiler_worklist(worklist.clone());
    let watcher = Arc::new(ProgressWatcher {
        progress: progress.clone(),
        frozen: AtomicBool::new(false),
    });
    heap.add_code_registry(watcher.clone());

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let compiler = {
        let worklist = worklist.clone();
        let progress = progress.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let _guard = worklist.barrier.enter();
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                progress.fetch_add(1, Ordering::SeqCst);
                worklist.barrier.safepoint();
            }
        })
    };
    ready_rx.recv().unwrap();

    heap.collect(CollectionRequest::Full);
    assert!(watcher.frozen.load(Ordering::SeqCst));
    assert!(!worklist.barrier.is_suspension_requested());

    stop.store(true, Ordering::Release);
    compiler.join().unwrap();
    assert_eq!(worklist.barrier.active_count(), 0);
}

#[test]
fn test_useful_plans_keep_their_cells() {
    let heap = heap();
    let plan = heap.allocate(1u64);
    let worklist = Arc::new(ThreadedWorklist::new(plan.as_cell(), true));
    heap.add_compiler_worklist(worklist.clone());

    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 1);
    assert_eq!(worklist.plans_removed.load(Ordering::SeqCst), 0);

    worklist.plan_is_useful.store(false, Ordering::SeqCst);
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 0);
    assert_eq!(worklist.plans_removed.load(Ordering::SeqCst), 1);
    assert_eq!(worklist.plan.load(Ordering::SeqCst), 0);
}

/// Code blocks keyed by the cell they were compiled for.
#[derive(Default)]
struct Registry {
    executing: Mutex<Vec<usize>>,
    installed: Mutex<Vec<usize>>,
    mark_clears: AtomicUsize,
    discards: AtomicUsize,
}

impl CodeRegistry for Registry {
    fn clear_marks(&self) {
        self.mark_clears.fetch_add(1, Ordering::SeqCst);
    }

    fn visit_live_code(&self, visitor: &mut SlotVisitor<'_>) {
        for &addr in self.executing.lock().iter() {
            if let Some(cell) = CellPtr::from_addr(addr) {
                visitor.append(cell);
            }
        }
    }

    fn clear_code_if_not_compiling(&self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }

    fn delete_unmarked_code(&self, heap: &Heap) {
        self.installed.lock().retain(|&addr| {
            CellPtr::from_addr(addr).is_some_and(|cell| heap.is_marked(cell))
        });
    }
}

#[test]
fn test_executing_code_is_a_root_and_dead_code_is_deleted() {
    let heap = heap();
    let running = heap.allocate(1u64);
    let idle = heap.allocate(2u64);
    let registry = Arc::new(Registry::default());
    registry.executing.lock().push(running.as_cell().addr());
    registry
        .installed
        .lock()
        .extend([running.as_cell().addr(), idle.as_cell().addr()]);
    heap.add_code_registry(registry.clone());

    heap.collect(CollectionRequest::Full);
    assert!(heap.is_marked(running));
    assert_eq!(*registry.installed.lock(), [running.as_cell().addr()]);
}

#[test]
fn test_code_marks_are_cleared_by_full_collections_only() {
    let heap = heap();
    let registry = Arc::new(Registry::default());
    heap.add_code_registry(registry.clone());

    heap.collect(CollectionRequest::Eden);
    assert_eq!(registry.mark_clears.load(Ordering::SeqCst), 0);
    heap.collect(CollectionRequest::Full);
    assert_eq!(registry.mark_clears.load(Ordering::SeqCst), 1);
}

#[test]
fn test_code_discard_is_rate_limited() {
    let heap = heap();
    let registry = Arc::new(Registry::default());
    heap.add_code_registry(registry.clone());

    heap.collect(CollectionRequest::Full);
    heap.collect(CollectionRequest::Full);
    heap.collect(CollectionRequest::Eden);
    assert_eq!(registry.discards.load(Ordering::SeqCst), 1);

    let eager = Heap::new(
        HeapConfig::default()
            .with_number_of_markers(1)
            .with_code_discard_interval(Duration::ZERO),
    );
    let registry = Arc::new(Registry::default());
    eager.add_code_registry(registry.clone());
    eager.collect(CollectionRequest::Full);
    eager.collect(CollectionRequest::Full);
    assert_eq!(registry.discards.load(Ordering::SeqCst), 2);
}
