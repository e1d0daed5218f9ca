//! Marking infrastructure.
//!
//! This module provides the pieces a collection is assembled from:
//! - Segmented mark stacks and the allocator recycling their segments
//! - The slot visitor and the shared data its parallel instances meet in
//! - Conservative and precise root gathering
//! - The remembered set behind the generational write barrier
//! - Lock ordering discipline for deadlock prevention

pub mod conservative;
pub mod mark_stack;
pub mod remembered;
pub mod root_visitor;
pub mod shared;
pub mod sync;
pub mod visitor;

pub use conservative::ConservativeRoots;
pub use mark_stack::{MarkStackArray, SegmentAllocator};
pub use remembered::{RememberedSet, WriteBarrierBuffer};
pub use root_visitor::HeapRootVisitor;
pub use shared::SharedMarkingData;
pub use visitor::{SharedDrainMode, SlotVisitor};
