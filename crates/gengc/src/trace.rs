//! The `Trace` trait and implementations for standard types.
//!
//! `Trace` is the field-level half of child visitation: a cell's default
//! [`visit_children`](crate::Cell::visit_children) calls `trace` on itself,
//! which recurses through fields until it reaches reference slots.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::Arc;

use crate::cell::{Cell, CellPtr, CellRef, PropertyStorage, Value, WriteBarrier};
use crate::gc::SlotVisitor;

/// A type whose cell references can be reported to a [`SlotVisitor`].
///
/// # Safety
///
/// `trace` must report every cell reference reachable through `self`.
pub unsafe trait Trace {
    /// Reports every cell reference held by `self`.
    fn trace(&self, visitor: &mut SlotVisitor<'_>);
}

// ============================================================================
// Reference slots
// ============================================================================

// SAFETY: reports the slot's current value.
unsafe impl Trace for WriteBarrier {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.append_value(self.get());
    }
}

// SAFETY: reports the value if it is a cell.
unsafe impl Trace for Value {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.append_value(*self);
    }
}

// SAFETY: reports the pointed-to cell.
unsafe impl Trace for CellPtr {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.append(*self);
    }
}

// SAFETY: reports the pointed-to cell.
unsafe impl<T: Cell> Trace for CellRef<T> {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.append(self.as_cell());
    }
}

// SAFETY: every slot is handed over as one mark set.
unsafe impl Trace for PropertyStorage {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.append_values(self.slots());
    }
}

// ============================================================================
// Primitives
// ============================================================================

macro_rules! impl_leaf_trace {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: holds no cell references.
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
            }
        )*
    };
}

impl_leaf_trace! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String, str,
    std::time::Duration,
    std::time::Instant,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicU32,
    std::sync::atomic::AtomicU64,
    std::sync::atomic::AtomicI64,
    std::sync::atomic::AtomicUsize,
}

// SAFETY: no data.
unsafe impl<T: ?Sized> Trace for std::marker::PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
}

// ============================================================================
// Containers
// ============================================================================

/// Pointers forward to their target.
macro_rules! impl_pointer_trace {
    ($($ptr:ident),*) => {
        $(
            // SAFETY: forwards to the single owned value.
            unsafe impl<T: Trace + ?Sized> Trace for $ptr<T> {
                #[inline]
                fn trace(&self, visitor: &mut SlotVisitor<'_>) {
                    (**self).trace(visitor);
                }
            }
        )*
    };
}

impl_pointer_trace!(Box, Arc);

// SAFETY: forwards to the referent.
unsafe impl<T: Trace + ?Sized> Trace for &T {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        (**self).trace(visitor);
    }
}

/// Collections visit whatever their `&`-iterator yields.
macro_rules! impl_collection_trace {
    ($([$($generics:tt)*] $ty:ty;)*) => {
        $(
            // SAFETY: every element is visited.
            unsafe impl<$($generics)*> Trace for $ty {
                #[inline]
                fn trace(&self, visitor: &mut SlotVisitor<'_>) {
                    for item in self {
                        item.trace(visitor);
                    }
                }
            }
        )*
    };
}

impl_collection_trace! {
    [T: Trace] [T];
    [T: Trace, const N: usize] [T; N];
    [T: Trace] Vec<T>;
    [T: Trace] VecDeque<T>;
    [T: Trace] Option<T>;
    [K: Trace, V: Trace, S: BuildHasher] HashMap<K, V, S>;
    [K: Trace, V: Trace] BTreeMap<K, V>;
}

macro_rules! impl_tuple_trace {
    () => {};
    ($head:ident $(, $tail:ident)*) => {
        // SAFETY: every element is visited.
        unsafe impl<$head: Trace $(, $tail: Trace)*> Trace for ($head, $($tail,)*) {
            #[inline]
            #[allow(non_snake_case)]
            fn trace(&self, visitor: &mut SlotVisitor<'_>) {
                let ($head, $($tail,)*) = self;
                $head.trace(visitor);
                $($tail.trace(visitor);)*
            }
        }
        impl_tuple_trace!($($tail),*);
    };
}

impl_tuple_trace!(A, B, C, D, E, F, G, H);

// ============================================================================
// Backing stores
// ============================================================================

// SAFETY: a buffer holds bytes, never cell references; reporting it keeps the
// storage alive and lets the copying space relocate it.
unsafe impl Trace for crate::space::copied::CopiedBuffer {
    #[inline]
    fn trace(&self, visitor: &mut SlotVisitor<'_>) {
        visitor.copy_later(self);
    }
}
