//! Collection triggers and next-cycle sizing.
//!
//! [`HeapLimits`] is pure bookkeeping: the heap feeds it allocation volume
//! and post-collection sizes, and asks it whether to collect, which kind of
//! collection to run, and whether the hard ceiling was breached.

use crate::config::{GrowthPolicy, HeapConfig, HeapType};
use crate::heap::{CollectionKind, CollectionRequest};

/// Trigger sizes and the counters that drive them.
#[derive(Debug, Clone)]
pub struct HeapLimits {
    heap_type: HeapType,
    ram_size: usize,
    growth: GrowthPolicy,
    generational: bool,
    ceiling: Option<usize>,
    min_heap_size: usize,
    max_heap_size: usize,
    max_eden_size: usize,
    size_after_last_collect: usize,
    size_after_last_full_collect: usize,
    bytes_allocated_this_cycle: usize,
    extra_memory_size: usize,
    total_bytes_visited: usize,
    total_bytes_copied: usize,
    should_do_full: bool,
}

impl HeapLimits {
    /// Initial limits: the first cycle may allocate the minimum heap size.
    #[must_use]
    pub fn new(config: &HeapConfig) -> Self {
        let ram_size = config.resolved_ram_size();
        let min_heap_size = config.growth.min_heap_size(config.heap_type, ram_size);
        Self {
            heap_type: config.heap_type,
            ram_size,
            growth: config.growth,
            generational: config.enable_generational,
            ceiling: config.max_heap_size,
            min_heap_size,
            max_heap_size: min_heap_size,
            max_eden_size: min_heap_size,
            size_after_last_collect: 0,
            size_after_last_full_collect: 0,
            bytes_allocated_this_cycle: 0,
            extra_memory_size: 0,
            total_bytes_visited: 0,
            total_bytes_copied: 0,
            should_do_full: false,
        }
    }

    /// Counts `bytes` of fresh allocation.
    pub fn did_allocate(&mut self, bytes: usize) {
        self.bytes_allocated_this_cycle = self.bytes_allocated_this_cycle.saturating_add(bytes);
    }

    /// Counts `bytes` of off-heap memory owned by cells.
    ///
    /// Counts toward the eden budget, so large external buffers bring the
    /// next collection forward.
    pub fn report_extra_memory(&mut self, bytes: usize) {
        self.extra_memory_size = self.extra_memory_size.saturating_add(bytes);
        self.did_allocate(bytes);
    }

    /// Whether the allocation volume warrants a collection.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        if self.bytes_allocated_this_cycle > self.max_eden_size {
            return true;
        }
        self.ceiling.is_some_and(|ceiling| {
            self.size_after_last_collect
                .saturating_add(self.bytes_allocated_this_cycle)
                > ceiling
        })
    }

    /// Resolves a request to the kind of collection that will run.
    ///
    /// Non-generational heaps always run full collections. A pending
    /// escalation turns any request into a full collection.
    #[must_use]
    pub const fn collection_kind(&self, request: CollectionRequest) -> CollectionKind {
        if !self.generational || self.should_do_full {
            return CollectionKind::Full;
        }
        match request {
            CollectionRequest::Any | CollectionRequest::Eden => CollectionKind::Eden,
            CollectionRequest::Full => CollectionKind::Full,
        }
    }

    /// Folds one mark phase's byte counts into the live-size estimate.
    ///
    /// Eden collections only see young cells, so their counts add to the
    /// totals of the previous cycles; a full collection starts over.
    pub fn record_marked_bytes(
        &mut self,
        kind: CollectionKind,
        visited: usize,
        copied: usize,
        extra: usize,
    ) -> usize {
        if kind == CollectionKind::Full {
            self.total_bytes_visited = 0;
            self.total_bytes_copied = 0;
        }
        self.total_bytes_visited = self.total_bytes_visited.saturating_add(visited);
        self.total_bytes_copied = self.total_bytes_copied.saturating_add(copied);
        self.total_bytes_visited
            .saturating_add(self.total_bytes_copied)
            .saturating_add(extra)
    }

    /// Recomputes trigger sizes after a collection left `current_size` live.
    pub fn did_collect(&mut self, kind: CollectionKind, current_size: usize) {
        match kind {
            CollectionKind::Full => {
                self.max_heap_size = self.min_heap_size.max(
                    self.growth
                        .proportional_heap_size(current_size, self.ram_size),
                );
                self.max_eden_size = self.max_heap_size.saturating_sub(current_size);
                self.size_after_last_full_collect = current_size;
                self.should_do_full = false;
            }
            CollectionKind::Eden => {
                self.max_eden_size = self.max_heap_size.saturating_sub(current_size);
                if self.eden_to_heap_ratio() < self.growth.min_eden_to_heap_ratio {
                    self.should_do_full = true;
                }
                self.max_heap_size = self
                    .max_heap_size
                    .saturating_add(current_size.saturating_sub(self.size_after_last_collect));
                self.max_eden_size = self.max_heap_size.saturating_sub(current_size);
            }
        }
        self.size_after_last_collect = current_size;
        self.bytes_allocated_this_cycle = 0;
        self.extra_memory_size = 0;
    }

    #[allow(clippy::cast_precision_loss)]
    fn eden_to_heap_ratio(&self) -> f64 {
        if self.max_heap_size == 0 {
            return 0.0;
        }
        self.max_eden_size as f64 / self.max_heap_size as f64
    }

    /// Whether `size` breaks the configured hard ceiling.
    #[must_use]
    pub fn exceeds_ceiling(&self, size: usize) -> bool {
        self.ceiling.is_some_and(|ceiling| size > ceiling)
    }

    /// The configured hard ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> Option<usize> {
        self.ceiling
    }

    /// Forces the next collection to be full.
    pub const fn request_full(&mut self) {
        self.should_do_full = true;
    }

    /// Whether the next collection will be full whatever is requested.
    #[must_use]
    pub const fn should_do_full(&self) -> bool {
        self.should_do_full
    }

    /// Smallest heap size any cycle is sized to.
    #[must_use]
    pub const fn min_heap_size(&self) -> usize {
        self.min_heap_size
    }

    /// Heap size the current cycle may grow to.
    #[must_use]
    pub const fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    /// Allocation budget of the current cycle.
    #[must_use]
    pub const fn max_eden_size(&self) -> usize {
        self.max_eden_size
    }

    /// Live size measured by the last collection.
    #[must_use]
    pub const fn size_after_last_collect(&self) -> usize {
        self.size_after_last_collect
    }

    /// Live size measured by the last full collection.
    #[must_use]
    pub const fn size_after_last_full_collect(&self) -> usize {
        self.size_after_last_full_collect
    }

    /// Bytes allocated since the last collection, extra memory included.
    #[must_use]
    pub const fn bytes_allocated_this_cycle(&self) -> usize {
        self.bytes_allocated_this_cycle
    }

    /// Off-heap bytes reported since the last collection.
    #[must_use]
    pub const fn extra_memory_size(&self) -> usize {
        self.extra_memory_size
    }

    /// The sizing profile.
    #[must_use]
    pub const fn heap_type(&self) -> HeapType {
        self.heap_type
    }
}
