//! # Lock Ordering Discipline for Deadlock Prevention
//!
//! Every mutex inside a [`Heap`](crate::Heap) is an [`OrderedMutex`] tagged
//! with a [`LockOrder`]. Locks must be acquired in non-decreasing level:
//!
//! | Level | Locks | Held by |
//! |-------|-------|---------|
//! | 1 | `ObjectSpace`, `RootTables` | allocation, root gathering |
//! | 2 | `StorageSpace` | copying-space bookkeeping |
//! | 3 | `Oversize`, `RememberedSet` | oversize regions, barrier flushes |
//! | 4 | `MarkingState`, `OpaqueRoots` | parallel marking and copying |
//! | 5 | `SegmentFreeList` | mark-stack segment recycling |
//!
//! Locks on the same level may nest in either order. Taking a lower level
//! while holding a higher one is a bug.
//!
//! ## Validation
//!
//! In debug builds each thread keeps a stack of the levels it holds, and
//! [`LockGuard::new`] panics with "Lock ordering violation" when the new level
//! is below the highest level held. Release builds compile the checks away.
//!
//! ```
//! use gengc::gc::sync::{LockGuard, LockOrder};
//!
//! let _space = LockGuard::new(LockOrder::ObjectSpace);
//! let _marking = LockGuard::new(LockOrder::MarkingState);
//! ```

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags.
///
/// Each lock has a unique order value; [`level`](Self::level) groups them
/// into the acquisition hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// The object space: block lists, allocators, sweeper (level 1).
    ObjectSpace = 1,

    /// Handle tables, the protected-value set and collaborator registries
    /// (level 1).
    RootTables = 2,

    /// Copying-space generations and block lists (level 2).
    StorageSpace = 3,

    /// Oversize copying-space regions (level 3).
    Oversize = 4,

    /// Write-barrier flushes into the remembered set (level 3).
    RememberedSet = 5,

    /// Shared mark stack and worker counts (level 4).
    MarkingState = 6,

    /// The shared opaque-roots set (level 4).
    OpaqueRoots = 7,

    /// Free list of mark-stack segments (level 5).
    SegmentFreeList = 8,
}

impl LockOrder {
    /// Unique order value of this lock.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Acquisition level of this lock.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub const fn level(self) -> u8 {
        match self {
            Self::ObjectSpace | Self::RootTables => 1,
            Self::StorageSpace => 2,
            Self::Oversize | Self::RememberedSet => 3,
            Self::MarkingState | Self::OpaqueRoots => 4,
            Self::SegmentFreeList => 5,
        }
    }
}

/// RAII record of a held lock level.
///
/// Validates the acquisition against the levels this thread already holds
/// and pops the level on drop.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Records acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `tag` is below a level already held.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, highest_held_level());
            push_level(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                state.stack.borrow_mut().pop();
            }
        });
    }
}

/// Disables lock order tracking on this thread.
///
/// Call during thread teardown, before thread-local storage is destroyed.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            state.is_shutdown.set(true);
        });
    }
}

/// Checks that `tag` may be acquired while `held` is the highest level held.
///
/// # Panics
///
/// Panics in debug builds on a downgrade.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn validate_lock_order(tag: LockOrder, held: u8) {
    debug_assert!(
        tag.level() >= held,
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding level {held}. Downgrades are not allowed.",
        tag.level(),
    );
    let _ = (tag, held);
}

#[cfg(debug_assertions)]
fn push_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag.level());
        }
    });
}

/// Highest lock level held by this thread, `0` when none.
#[must_use]
pub fn highest_held_level() -> u8 {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return 0;
            }
            state.stack.borrow().iter().copied().max().unwrap_or(0)
        })
        .unwrap_or(0)
}

// ============================================================================
// OrderedMutex
// ============================================================================

/// A `parking_lot` mutex that validates lock ordering on every acquisition.
pub struct OrderedMutex<T> {
    order: LockOrder,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wraps `value` under lock level `order`.
    pub const fn new(order: LockOrder, value: T) -> Self {
        Self {
            order,
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock.
    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        let order = LockGuard::new(self.order);
        OrderedMutexGuard {
            guard: self.inner.lock(),
            _order: order,
        }
    }

    /// Acquires the lock only if it is free.
    pub fn try_lock(&self) -> Option<OrderedMutexGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        Some(OrderedMutexGuard {
            guard,
            _order: LockGuard::new(self.order),
        })
    }

    /// Consumes the mutex.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Mutable access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> OrderedMutex<T> {
    /// A mutex around `T::default()`.
    #[must_use]
    pub fn with_default(order: LockOrder) -> Self {
        Self::new(order, T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("order", &self.order)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard of an [`OrderedMutex`]. Unlocks before releasing the order record.
pub struct OrderedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> OrderedMutexGuard<'_, T> {
    /// Blocks on `condvar`, releasing the lock while waiting.
    pub fn wait(&mut self, condvar: &Condvar) {
        condvar.wait(&mut self.guard);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::{highest_held_level, LockGuard, LockOrder, OrderedMutex};

    #[test]
    fn test_lock_order_values() {
        assert_eq!(LockOrder::ObjectSpace.order_value(), 1);
        assert_eq!(LockOrder::RootTables.order_value(), 2);
        assert_eq!(LockOrder::MarkingState.order_value(), 6);
        assert_eq!(LockOrder::SegmentFreeList.order_value(), 8);
    }

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::ObjectSpace.level(), 1);
        assert_eq!(LockOrder::RootTables.level(), 1);
        assert_eq!(LockOrder::StorageSpace.level(), 2);
        assert_eq!(LockOrder::Oversize.level(), 3);
        assert_eq!(LockOrder::OpaqueRoots.level(), 4);
        assert_eq!(LockOrder::SegmentFreeList.level(), 5);
    }

    #[test]
    fn test_lock_guard_valid_order() {
        let _guard1 = LockGuard::new(LockOrder::ObjectSpace);
        let _guard2 = LockGuard::new(LockOrder::RootTables);
        let _guard3 = LockGuard::new(LockOrder::StorageSpace);
        let _guard4 = LockGuard::new(LockOrder::MarkingState);
        let _guard5 = LockGuard::new(LockOrder::SegmentFreeList);
    }

    #[test]
    fn test_same_level_any_order() {
        let _guard1 = LockGuard::new(LockOrder::RootTables);
        let _guard2 = LockGuard::new(LockOrder::ObjectSpace);
        let _guard3 = LockGuard::new(LockOrder::OpaqueRoots);
        let _guard4 = LockGuard::new(LockOrder::MarkingState);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_lock_guard_invalid_order_should_panic() {
        let _guard1 = LockGuard::new(LockOrder::MarkingState);
        let _guard2 = LockGuard::new(LockOrder::ObjectSpace);
    }

    #[test]
    fn test_state_restoration_after_drop() {
        {
            let _guard1 = LockGuard::new(LockOrder::MarkingState);
            {
                let _guard2 = LockGuard::new(LockOrder::SegmentFreeList);
            }
        }
        let _guard3 = LockGuard::new(LockOrder::ObjectSpace);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_highest_level_tracks_guards() {
        assert_eq!(highest_held_level(), 0);
        let guard = LockGuard::new(LockOrder::StorageSpace);
        assert_eq!(highest_held_level(), 2);
        drop(guard);
        assert_eq!(highest_held_level(), 0);
    }

    #[test]
    fn test_ordered_mutex_nesting() {
        let outer = OrderedMutex::new(LockOrder::ObjectSpace, 1);
        let inner = OrderedMutex::new(LockOrder::SegmentFreeList, 2);
        let a = outer.lock();
        let b = inner.lock();
        assert_eq!(*a + *b, 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_ordered_mutex_downgrade_panics() {
        let outer = OrderedMutex::new(LockOrder::MarkingState, ());
        let inner = OrderedMutex::new(LockOrder::StorageSpace, ());
        let _a = outer.lock();
        let _b = inner.lock();
    }
}
