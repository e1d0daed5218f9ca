//! GC metrics and statistics.
//!
//! Everything here is owned by one [`Heap`](crate::Heap): the last
//! collection's [`GcMetrics`], a [`GcHistory`] ring of recent ones, and
//! cumulative [`HeapStatistics`] counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::heap::CollectionKind;

/// Statistics from one garbage collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Wall-clock pause of the collection.
    pub duration: Duration,
    /// Scope of the collection.
    pub collection_type: CollectionType,
    /// Live heap size when the collection started.
    pub bytes_before: usize,
    /// Live heap size used for the next cycle's heuristics.
    pub bytes_after: usize,
    /// Cells whose children were visited.
    pub visit_count: usize,
    /// Bytes of cells visited.
    pub bytes_visited: usize,
    /// Bytes of backing stores reported live.
    pub bytes_copied: usize,
    /// Candidate roots found by conservative scanning.
    pub conservative_roots: usize,
    /// Weak slots cleared.
    pub weak_handles_cleared: usize,
    /// Duration of root gathering, convergence and the weak loop.
    pub mark_duration: Duration,
    /// Duration of the copy phase.
    pub copy_duration: Duration,
    /// Duration of finalization.
    pub finalize_duration: Duration,
    /// Whether the copying space evacuated any block.
    pub copied: bool,
    /// Collections run by this heap, this one included.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            collection_type: CollectionType::None,
            bytes_before: 0,
            bytes_after: 0,
            visit_count: 0,
            bytes_visited: 0,
            bytes_copied: 0,
            conservative_roots: 0,
            weak_handles_cleared: 0,
            mark_duration: Duration::ZERO,
            copy_duration: Duration::ZERO,
            finalize_duration: Duration::ZERO,
            copied: false,
            total_collections: 0,
        }
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Young cells only, plus the remembered set.
    Eden = 1,
    /// The whole heap.
    Full = 2,
}

impl From<CollectionKind> for CollectionType {
    fn from(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Eden => Self::Eden,
            CollectionKind::Full => Self::Full,
        }
    }
}

/// Captures phase durations during a collection.
///
/// # Example
///
/// ```
/// use gengc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
/// timer.start();
/// // ... copying ...
/// timer.end_copy();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Mark phase time.
    pub mark: Duration,
    /// Copy phase time.
    pub copy: Duration,
    /// Finalize phase time.
    pub finalize: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            copy: Duration::ZERO,
            finalize: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the copy phase and record its duration.
    pub fn end_copy(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.copy = start.elapsed();
        }
    }

    /// End the finalize phase and record its duration.
    pub fn end_finalize(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.finalize = start.elapsed();
        }
    }
}

/// Cumulative counters for one heap.
#[derive(Debug, Default)]
pub struct HeapStatistics {
    collections: AtomicUsize,
    eden_collections: AtomicUsize,
    full_collections: AtomicUsize,
    pause_ns: AtomicU64,
    bytes_copied: AtomicUsize,
    objects_committed: AtomicUsize,
    storage_committed: AtomicUsize,
}

impl HeapStatistics {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            eden_collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            bytes_copied: AtomicUsize::new(0),
            objects_committed: AtomicUsize::new(0),
            storage_committed: AtomicUsize::new(0),
        }
    }

    /// Collections of either kind.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Eden collections.
    #[inline]
    #[must_use]
    pub fn eden_collections(&self) -> usize {
        self.eden_collections.load(Ordering::Relaxed)
    }

    /// Full collections.
    #[inline]
    #[must_use]
    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Total pause time.
    #[inline]
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Backing-store bytes reported live, summed over all collections.
    #[inline]
    #[must_use]
    pub fn total_bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Bytes the object space held from the OS after the last collection.
    #[inline]
    #[must_use]
    pub fn object_space_committed(&self) -> usize {
        self.objects_committed.load(Ordering::Relaxed)
    }

    /// Bytes the copying space held from the OS after the last collection.
    #[inline]
    #[must_use]
    pub fn storage_space_committed(&self) -> usize {
        self.storage_committed.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, metrics: &GcMetrics, objects_committed: usize, storage_committed: usize) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        match metrics.collection_type {
            CollectionType::Eden => {
                self.eden_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Full => {
                self.full_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        self.pause_ns.fetch_add(
            metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.bytes_copied.fetch_add(metrics.bytes_copied, Ordering::Relaxed);
        self.objects_committed.store(objects_committed, Ordering::Relaxed);
        self.storage_committed.store(storage_committed, Ordering::Relaxed);
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

/// Fixed-size ring buffer of recent [`GcMetrics`] snapshots.
///
/// The collector pushes while any thread may read; both go through one
/// lock, so a reader never sees a half-written snapshot.
#[derive(Debug)]
pub struct GcHistory {
    ring: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    buffer: [GcMetrics; HISTORY_SIZE],
    written: usize,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create a new `GcHistory` with an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: parking_lot::const_mutex(Ring {
                buffer: [GcMetrics::new(); HISTORY_SIZE],
                written: 0,
            }),
        }
    }

    pub(crate) fn push(&self, metrics: GcMetrics) {
        let mut ring = self.ring.lock();
        let slot = ring.written % HISTORY_SIZE;
        ring.buffer[slot] = metrics;
        ring.written += 1;
    }

    /// Number of snapshots ever recorded; may exceed the buffer size.
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.ring.lock().written
    }

    /// The most recent `n` snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let ring = self.ring.lock();
        let total = ring.written;
        let n = n.min(HISTORY_SIZE).min(total);
        (total - n..total)
            .map(|i| ring.buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// Average pause over the most recent `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.duration.as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Longest pause over the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
