//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations. Without it
//! every helper is an empty inline function.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::heap::CollectionKind;

    /// Phases of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Suspend compiler threads, reset the remembered set, freeze allocation.
        StopAllocation,
        /// Gather roots, converge markers and resolve weak references.
        MarkRoots,
        /// Clear weak slots whose referents died.
        ReapWeakHandles,
        /// Evacuate sparse copying-space blocks.
        CopyBackingStores,
        /// Run unconditional finalizers and drop dead code.
        Finalize,
        /// Hand the sweeper its snapshot and reset allocators.
        Sweep,
    }

    /// Stable identifier for a GC run.
    ///
    /// Correlates every event of one collection. Starts at 1 and increases
    /// monotonically across all heaps in the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(kind: CollectionKind, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = ?kind,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, bytes_after: usize) {
        tracing::debug!(phase = ?phase, bytes_after, "phase_end");
    }

    /// Log how many conservative roots were found.
    pub fn log_conservative_roots(roots: usize, words_scanned: usize, pinned: usize) {
        tracing::debug!(roots, words_scanned, pinned, "conservative_roots");
    }

    /// Log the copying space's decision for this cycle.
    pub fn log_copy_plan(should_copy: bool, blocks_to_copy: usize, utilization: f64) {
        tracing::debug!(should_copy, blocks_to_copy, utilization, "copy_plan");
    }

    /// Log the trigger sizes computed for the next cycle.
    pub fn log_heuristics(max_heap_size: usize, max_eden_size: usize, should_do_full: bool) {
        tracing::debug!(max_heap_size, max_eden_size, should_do_full, "heuristics");
    }

    /// One summary line per collection.
    pub fn log_collection_summary(
        kind: CollectionKind,
        size_before: usize,
        size_after: usize,
        pause: std::time::Duration,
    ) {
        tracing::info!(
            collection_type = ?kind,
            size_before,
            size_after,
            pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX),
            "gc {kind:?}: {size_before} => {size_after} bytes"
        );
    }

    /// Log the heap-ceiling violation that precedes an abort.
    pub fn log_ceiling_exceeded(size: usize, ceiling: usize) {
        tracing::error!(size, ceiling, "heap size exceeds the configured ceiling; aborting");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn, clippy::needless_pass_by_value)]
pub mod internal {
    use crate::heap::CollectionKind;

    /// Phases of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Suspend compiler threads, reset the remembered set, freeze allocation.
        StopAllocation,
        /// Gather roots, converge markers and resolve weak references.
        MarkRoots,
        /// Clear weak slots whose referents died.
        ReapWeakHandles,
        /// Evacuate sparse copying-space blocks.
        CopyBackingStores,
        /// Run unconditional finalizers and drop dead code.
        Finalize,
        /// Hand the sweeper its snapshot and reset allocators.
        Sweep,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    #[inline]
    pub fn trace_gc_collection(_kind: CollectionKind, _gc_id: GcId) {}

    #[inline]
    pub fn trace_phase(_phase: GcPhase) {}

    #[inline]
    pub fn log_phase_start(_phase: GcPhase, _bytes_before: usize) {}

    #[inline]
    pub fn log_phase_end(_phase: GcPhase, _bytes_after: usize) {}

    #[inline]
    pub fn log_conservative_roots(_roots: usize, _words_scanned: usize, _pinned: usize) {}

    #[inline]
    pub fn log_copy_plan(_should_copy: bool, _blocks_to_copy: usize, _utilization: f64) {}

    #[inline]
    pub fn log_heuristics(_max_heap_size: usize, _max_eden_size: usize, _should_do_full: bool) {}

    #[inline]
    pub fn log_collection_summary(
        _kind: CollectionKind,
        _size_before: usize,
        _size_after: usize,
        _pause: std::time::Duration,
    ) {
    }

    #[inline]
    pub fn log_ceiling_exceeded(_size: usize, _ceiling: usize) {}
}

pub use internal::{GcId, GcPhase};
