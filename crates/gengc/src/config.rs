//! Heap configuration.
//!
//! A [`HeapConfig`] is handed to [`Heap::new`](crate::Heap::new) and is
//! read-only afterwards. Sizing constants that are pragmatic tuning rather
//! than derived values live in [`GrowthPolicy`] so embedders can adjust them.

use std::num::NonZeroUsize;
use std::time::Duration;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Default sizing profile of the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeapType {
    /// Starts small (1MB) and grows on demand.
    #[default]
    Small,
    /// Starts at up to 32MB, capped by a fraction of physical RAM.
    Large,
}

/// Constants driving the next-cycle trigger sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthPolicy {
    /// Minimum heap size for [`HeapType::Small`].
    pub small_heap_size: usize,
    /// Minimum heap size for [`HeapType::Large`], before the RAM cap.
    pub large_heap_size: usize,
    /// Fraction of RAM that caps the large-heap minimum.
    pub large_heap_ram_fraction: f64,
    /// Below this fraction of RAM the heap grows by `aggressive_growth`.
    pub aggressive_ram_fraction: f64,
    /// Below this fraction of RAM the heap grows by `moderate_growth`.
    pub moderate_ram_fraction: f64,
    /// Growth factor for small heaps.
    pub aggressive_growth: f64,
    /// Growth factor for medium heaps.
    pub moderate_growth: f64,
    /// Growth factor once the heap is a large share of RAM.
    pub conservative_growth: f64,
    /// After an eden collection, an eden budget below this share of the
    /// heap escalates the next collection to full.
    pub min_eden_to_heap_ratio: f64,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            small_heap_size: MB,
            large_heap_size: 32 * MB,
            large_heap_ram_fraction: 0.25,
            aggressive_ram_fraction: 0.25,
            moderate_ram_fraction: 0.5,
            aggressive_growth: 2.0,
            moderate_growth: 1.5,
            conservative_growth: 1.25,
            min_eden_to_heap_ratio: 1.0 / 3.0,
        }
    }
}

impl GrowthPolicy {
    /// Smallest heap a collection may size the next cycle to.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn min_heap_size(&self, heap_type: HeapType, ram_size: usize) -> usize {
        match heap_type {
            HeapType::Small => self.small_heap_size,
            HeapType::Large => {
                let cap = (ram_size as f64 * self.large_heap_ram_fraction) as usize;
                self.large_heap_size.min(cap)
            }
        }
    }

    /// Heap size after proportional growth from `heap_size`.
    ///
    /// Growth is generous while the heap is a small share of RAM and
    /// tightens as it approaches half of RAM.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn proportional_heap_size(&self, heap_size: usize, ram_size: usize) -> usize {
        let ram = ram_size as f64;
        let size = heap_size as f64;
        let factor = if size < ram * self.aggressive_ram_fraction {
            self.aggressive_growth
        } else if size < ram * self.moderate_ram_fraction {
            self.moderate_growth
        } else {
            self.conservative_growth
        };
        (size * factor) as usize
    }
}

/// Runtime configuration for a [`Heap`](crate::Heap).
///
/// # Example
///
/// ```
/// use gengc::{HeapConfig, HeapType};
///
/// let config = HeapConfig::default()
///     .with_heap_type(HeapType::Large)
///     .with_number_of_markers(4)
///     .with_max_heap_size(Some(512 * 1024 * 1024));
/// assert_eq!(config.number_of_markers, 4);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Minimum/growth sizing profile.
    pub heap_type: HeapType,
    /// Hard ceiling; exceeding it after a collection aborts the process.
    pub max_heap_size: Option<usize>,
    /// Number of threads that mark and copy, including the collecting thread.
    pub number_of_markers: usize,
    /// Enables the remembered set and eden collections.
    pub enable_generational: bool,
    /// Emit one summary line per collection (requires the `tracing` feature).
    pub log_gc: bool,
    /// Emit per-phase diagnostics (requires the `tracing` feature).
    pub verbose: bool,
    /// Overwrite dead cells with a poison pattern after sweeping.
    pub zombie_mode: bool,
    /// Keep every allocated cell alive; destructors only run at heap teardown.
    pub objects_are_immortal: bool,
    /// Scan the collecting thread's native stack and registers conservatively.
    pub scan_native_stack: bool,
    /// Override for the detected physical memory size.
    pub ram_size: Option<usize>,
    /// Sizing constants.
    pub growth: GrowthPolicy,
    /// Copying-space utilization at or below which a full collection compacts.
    pub min_heap_utilization: f64,
    /// Copied blocks at least this full are kept in place rather than evacuated.
    pub min_copied_block_utilization: f64,
    /// Minimum wall-clock time between compiled-code discards.
    pub code_discard_interval: Duration,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_type: HeapType::Small,
            max_heap_size: None,
            number_of_markers: default_number_of_markers(),
            enable_generational: true,
            log_gc: false,
            verbose: false,
            zombie_mode: false,
            objects_are_immortal: false,
            scan_native_stack: false,
            ram_size: None,
            growth: GrowthPolicy::default(),
            min_heap_utilization: 0.8,
            min_copied_block_utilization: 0.9,
            code_discard_interval: Duration::from_secs(60),
        }
    }
}

fn default_number_of_markers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(8)
}

impl HeapConfig {
    /// Sets the sizing profile.
    #[must_use]
    pub const fn with_heap_type(mut self, heap_type: HeapType) -> Self {
        self.heap_type = heap_type;
        self
    }

    /// Sets the hard heap ceiling.
    #[must_use]
    pub const fn with_max_heap_size(mut self, max: Option<usize>) -> Self {
        self.max_heap_size = max;
        self
    }

    /// Sets the marker thread count. Zero is treated as one.
    #[must_use]
    pub const fn with_number_of_markers(mut self, markers: usize) -> Self {
        self.number_of_markers = markers;
        self
    }

    /// Toggles generational collection.
    #[must_use]
    pub const fn with_generational(mut self, enabled: bool) -> Self {
        self.enable_generational = enabled;
        self
    }

    /// Toggles the per-collection summary log.
    #[must_use]
    pub const fn with_log_gc(mut self, enabled: bool) -> Self {
        self.log_gc = enabled;
        self
    }

    /// Toggles per-phase diagnostics.
    #[must_use]
    pub const fn with_verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Toggles zombie filling of dead cells.
    #[must_use]
    pub const fn with_zombie_mode(mut self, enabled: bool) -> Self {
        self.zombie_mode = enabled;
        self
    }

    /// Toggles immortal objects.
    #[must_use]
    pub const fn with_objects_are_immortal(mut self, enabled: bool) -> Self {
        self.objects_are_immortal = enabled;
        self
    }

    /// Toggles conservative scanning of the collecting thread's stack.
    #[must_use]
    pub const fn with_native_stack_scanning(mut self, enabled: bool) -> Self {
        self.scan_native_stack = enabled;
        self
    }

    /// Overrides the physical memory size used by the heuristics.
    #[must_use]
    pub const fn with_ram_size(mut self, ram_size: usize) -> Self {
        self.ram_size = Some(ram_size);
        self
    }

    /// Replaces the sizing constants.
    #[must_use]
    pub const fn with_growth_policy(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    /// Sets the minimum wall-clock gap between compiled-code discards.
    #[must_use]
    pub const fn with_code_discard_interval(mut self, interval: Duration) -> Self {
        self.code_discard_interval = interval;
        self
    }

    /// Effective marker count, never zero.
    #[must_use]
    pub const fn markers(&self) -> usize {
        if self.number_of_markers == 0 {
            1
        } else {
            self.number_of_markers
        }
    }

    /// Physical memory size used by the heuristics.
    #[must_use]
    pub fn resolved_ram_size(&self) -> usize {
        self.ram_size.unwrap_or_else(sys_alloc::physical_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: usize = 1024 * MB;

    #[test]
    fn test_min_heap_size_by_type() {
        let policy = GrowthPolicy::default();
        assert_eq!(policy.min_heap_size(HeapType::Small, 8 * GB), MB);
        assert_eq!(policy.min_heap_size(HeapType::Large, 8 * GB), 32 * MB);
        // Large heaps are capped at a quarter of RAM on small machines.
        assert_eq!(policy.min_heap_size(HeapType::Large, 64 * MB), 16 * MB);
    }

    #[test]
    fn test_proportional_growth_bands() {
        let policy = GrowthPolicy::default();
        let ram = 4 * GB;
        assert_eq!(policy.proportional_heap_size(100 * MB, ram), 200 * MB);
        assert_eq!(policy.proportional_heap_size(1536 * MB, ram), 2304 * MB);
        assert_eq!(policy.proportional_heap_size(3 * GB, ram), 3840 * MB);
    }

    #[test]
    fn test_markers_never_zero() {
        let config = HeapConfig::default().with_number_of_markers(0);
        assert_eq!(config.markers(), 1);
        assert!(HeapConfig::default().markers() >= 1);
    }

    #[test]
    fn test_ram_override() {
        let config = HeapConfig::default().with_ram_size(123 * MB);
        assert_eq!(config.resolved_ram_size(), 123 * MB);
        assert!(HeapConfig::default().resolved_ram_size() > 0);
    }
}
