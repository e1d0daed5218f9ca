//! Hooks into a compiler tier that runs beside the mutator.
//!
//! Compiler threads hold references to cells inside compilation plans, and
//! compiled code is itself reachable from the heap. The collector therefore
//! parks every worklist before it touches anything, asks the code registry
//! what to keep, and lets plans whose inputs died be discarded.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::gc::SlotVisitor;
use crate::heap::Heap;

/// A queue of background compilations.
///
/// Suspension is two-phase: the heap calls
/// [`request_suspension`](Self::request_suspension) on every worklist first
/// and only then [`wait_for_suspension`](Self::wait_for_suspension) on each,
/// so all compiler threads wind down concurrently.
pub trait CompilerWorklist: Send + Sync {
    /// Asks compiler threads to park at their next safepoint.
    fn request_suspension(&self);

    /// Blocks until every compiler thread has parked.
    fn wait_for_suspension(&self);

    /// Lets compiler threads run again.
    fn resume(&self);

    /// Strengthens references held by plans that are still worth finishing.
    fn visit_weak_references(&self, _visitor: &mut SlotVisitor<'_>) {}

    /// Drops plans that reference cells which did not survive.
    fn remove_dead_plans(&self, _heap: &Heap) {}
}

/// The set of compiled code blocks.
pub trait CodeRegistry: Send + Sync {
    /// Forgets which code blocks were seen live last cycle.
    fn clear_marks(&self) {}

    /// Appends the cells referenced by code that is currently executing or
    /// otherwise known live.
    fn visit_live_code(&self, _visitor: &mut SlotVisitor<'_>) {}

    /// Throws away compiled code that no compiler thread is working on.
    fn clear_code_if_not_compiling(&self) {}

    /// Frees code blocks that were not marked this cycle.
    fn delete_unmarked_code(&self, _heap: &Heap) {}
}

#[derive(Debug, Default)]
struct BarrierState {
    requested: bool,
    active: usize,
    parked: usize,
    epoch: u64,
}

/// A reusable two-phase pause barrier for compiler threads.
///
/// Workers bracket their work with [`enter`](Self::enter) and poll
/// [`safepoint`](Self::safepoint); the collector side maps straight onto
/// [`CompilerWorklist`]'s suspension methods.
///
/// # Example
///
/// ```
/// use gengc::SuspensionBarrier;
///
/// let barrier = SuspensionBarrier::new();
/// barrier.request_suspension();
/// barrier.wait_for_suspension(); // nobody is running, returns at once
/// barrier.resume();
/// ```
#[derive(Debug, Default)]
pub struct SuspensionBarrier {
    state: Mutex<BarrierState>,
    condition: Condvar,
}

impl SuspensionBarrier {
    /// A barrier with no running participants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread as running until the guard drops.
    ///
    /// Blocks first if a suspension is in progress.
    pub fn enter(&self) -> SuspensionGuard<'_> {
        let mut state = self.state.lock();
        while state.requested {
            self.condition.wait(&mut state);
        }
        state.active += 1;
        SuspensionGuard { barrier: self }
    }

    /// Parks here while a suspension is requested.
    pub fn safepoint(&self) {
        let mut state = self.state.lock();
        if !state.requested {
            return;
        }
        state.parked += 1;
        let epoch = state.epoch;
        self.condition.notify_all();
        while state.requested && state.epoch == epoch {
            self.condition.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Phase one: asks running participants to park.
    pub fn request_suspension(&self) {
        self.state.lock().requested = true;
    }

    /// Phase two: waits until every running participant parked.
    pub fn wait_for_suspension(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.requested, "wait_for_suspension without a request");
        while state.parked < state.active {
            self.condition.wait(&mut state);
        }
    }

    /// Releases parked participants.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.requested = false;
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.condition.notify_all();
    }

    /// Whether a suspension is requested.
    #[must_use]
    pub fn is_suspension_requested(&self) -> bool {
        self.state.lock().requested
    }

    /// Participants currently registered.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }
}

/// Keeps a participant registered with a [`SuspensionBarrier`].
#[derive(Debug)]
#[must_use = "dropping the guard leaves the barrier immediately"]
pub struct SuspensionGuard<'a> {
    barrier: &'a SuspensionBarrier,
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock();
        state.active -= 1;
        drop(state);
        self.barrier.condition.notify_all();
    }
}

/// Decides when compiled code may be thrown away.
///
/// Discarding code trades recompilation time for memory, so it happens at
/// most once per interval and only in full collections.
#[derive(Debug)]
pub(crate) struct CodeDiscardPolicy {
    interval: std::time::Duration,
    last_discard: Option<Instant>,
}

impl CodeDiscardPolicy {
    pub(crate) const fn new(interval: std::time::Duration) -> Self {
        Self {
            interval,
            last_discard: None,
        }
    }

    /// Whether to discard now; records the discard if so.
    pub(crate) fn should_discard(&mut self, now: Instant) -> bool {
        let due = self
            .last_discard
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last_discard = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_barrier_without_participants_is_immediate() {
        let barrier = SuspensionBarrier::new();
        barrier.request_suspension();
        assert!(barrier.is_suspension_requested());
        barrier.wait_for_suspension();
        barrier.resume();
        assert!(!barrier.is_suspension_requested());
    }

    #[test]
    fn test_barrier_parks_running_workers() {
        let barrier = Arc::new(SuspensionBarrier::new());
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let stop = Arc::clone(&stop);
                let progress = Arc::clone(&progress);
                let (ready_tx, ready_rx) = std::sync::mpsc::channel();
                let handle = std::thread::spawn(move || {
                    let _guard = barrier.enter();
                    ready_tx.send(()).unwrap();
                    while !stop.load(Ordering::Acquire) {
                        progress.fetch_add(1, Ordering::Relaxed);
                        barrier.safepoint();
                    }
                });
                ready_rx.recv().unwrap();
                handle
            })
            .collect();

        assert_eq!(barrier.active_count(), 3);
        barrier.request_suspension();
        barrier.wait_for_suspension();
        let frozen = progress.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::Relaxed), frozen);

        stop.store(true, Ordering::Release);
        barrier.resume();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(barrier.active_count(), 0);
    }

    #[test]
    fn test_code_discard_interval() {
        let mut policy = CodeDiscardPolicy::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(policy.should_discard(start));
        assert!(!policy.should_discard(start + Duration::from_secs(30)));
        assert!(policy.should_discard(start + Duration::from_secs(61)));
    }
}
