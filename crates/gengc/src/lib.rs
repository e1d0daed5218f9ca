//! A generational, mostly parallel garbage-collector core.
//!
//! `gengc` manages the object heap of a dynamic-language runtime. Cells live
//! in size-classed blocks and never move; variable-length backing stores
//! live in a separate copying space and are compacted when it pays off.
//!
//! # Features
//!
//! - **Generational**: eden collections trace only young cells, with a
//!   write barrier and remembered set standing in for old-to-young edges
//! - **Conservative roots**: the native stack, registers and any registered
//!   raw region are scanned for words that name cells
//! - **Parallel marking**: helper threads steal from a shared segmented
//!   mark stack until the heap converges
//! - **Weak references**: weak handles, owner-driven rescue and
//!   fixpoint-iterated harvesters
//! - **Copying backing stores**: sparse storage blocks are evacuated after
//!   marking while pinned and dense blocks stay in place
//!
//! # Quick Start
//!
//! ```
//! use gengc::{Cell, CollectionRequest, Heap, HeapConfig, SlotVisitor, Strong, Trace, WriteBarrier};
//!
//! struct Pair {
//!     left: WriteBarrier,
//!     right: WriteBarrier,
//! }
//!
//! unsafe impl Trace for Pair {
//!     fn trace(&self, visitor: &mut SlotVisitor<'_>) {
//!         self.left.trace(visitor);
//!         self.right.trace(visitor);
//!     }
//! }
//!
//! unsafe impl Cell for Pair {}
//!
//! let heap = Heap::new(HeapConfig::default().with_number_of_markers(1));
//! let leaf = heap.allocate(7i32);
//! let root = Strong::allocate(&heap, Pair {
//!     left: WriteBarrier::new(leaf.into()),
//!     right: WriteBarrier::empty(),
//! });
//!
//! heap.allocate(8i32); // garbage
//! heap.collect(CollectionRequest::Full);
//! heap.collect_all_garbage();
//! assert_eq!(heap.object_count(), 2);
//! drop(root);
//! ```
//!
//! # Thread Safety
//!
//! [`Heap`] is `Send + Sync`. Any thread may allocate; collections are
//! serialized and block allocating threads until the cycle ends. Roots held
//! by other threads must be registered as handles, protected values or
//! [`ConservativeRootSource`]s, since only the collecting thread's own stack
//! is scanned. A bare [`Heap::allocate`] result is unrooted, and another
//! thread's collection may free it before it is stored; allocate through
//! [`Strong::allocate`] or [`HandleScope::allocate`] to root the cell
//! before any collection can start.
//!
//! Rooting entry points check their argument: handing
//! [`Heap::protect`] or [`Strong::new`] anything but a live cell of the
//! heap panics, and barriers on such a pointer are ignored.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cell;
mod compiler;
mod config;
mod defer;
pub mod gc;
mod handles;
mod heap;
mod limits;
pub mod metrics;
mod roots;
pub mod space;
mod stack;
mod trace;
mod tracing;

// Re-export public API
pub use cell::{class_info, Cell, CellHeader, CellPtr, CellRef, ClassInfo, PropertyStorage, Value, WriteBarrier};
pub use compiler::{CodeRegistry, CompilerWorklist, SuspensionBarrier, SuspensionGuard};
pub use config::{GrowthPolicy, HeapConfig, HeapType};
pub use defer::{DeferGc, DeferGcForAWhile};
pub use gc::{ConservativeRoots, HeapRootVisitor, SlotVisitor};
pub use handles::{EscapableHandleScope, HandleScope, Local, Strong, Weak, WeakHandleOwner};
pub use heap::{CollectionKind, CollectionRequest, Heap, HeapOperation};
pub use limits::HeapLimits;
pub use metrics::{CollectionType, GcHistory, GcMetrics, HeapStatistics};
pub use roots::{ConservativeRootSource, RootProvider, UnconditionalFinalizer, WeakReferenceHarvester};
pub use space::{CopiedBuffer, CopyToken, CopyVisitor};
pub use stack::StackBounds;
pub use trace::Trace;
pub use tracing::{GcId, GcPhase};

// Re-export derive macros when feature is enabled
#[cfg(feature = "derive")]
pub use gengc_derive::{Cell, Trace};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    /// Clear CPU registers so stale pointer values are not treated as roots.
    ///
    /// Useful in tests that scan the native stack and expect a cell to die
    /// even though its address may linger in a callee-saved register.
    ///
    /// # Safety
    ///
    /// The callee-saved registers must not hold values the caller needs.
    pub unsafe fn clear_registers() {
        // SAFETY: forwarded from the caller.
        unsafe { crate::stack::clear_registers() };
    }
}
