//! Heap memory: the object space for cells and the copying space for
//! backing stores.

pub mod block;
pub mod block_allocator;
pub mod copied;
pub mod marked_space;

pub use block::{BlockId, MarkedBlock, BLOCK_SIZE};
pub use copied::{CopiedBuffer, CopiedSpace, CopyToken, CopyVisitor};
pub use marked_space::{CellIndex, MarkedSpace};
