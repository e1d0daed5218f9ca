//! Heap cells: header layout, type descriptors and reference slots.
//!
//! Every garbage-collected allocation is a [`CellHeader`] followed by the
//! value. The header points at a per-type [`ClassInfo`] which carries the
//! function pointers the collector dispatches through: child visitation,
//! backing-store relocation and destruction.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::gc::SlotVisitor;
use crate::heap::Heap;
use crate::space::copied::{CopyToken, CopyVisitor};
use crate::trace::Trace;

/// Type descriptor shared by all cells of one Rust type.
pub struct ClassInfo {
    name: fn() -> &'static str,
    type_id: fn() -> TypeId,
    size: usize,
    is_compound: bool,
    needs_destruction: bool,
    visit_children: unsafe fn(CellPtr, &mut SlotVisitor<'_>),
    copy_backing_store: unsafe fn(CellPtr, &mut CopyVisitor<'_>, CopyToken),
    destroy: unsafe fn(CellPtr),
}

impl ClassInfo {
    /// Type name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        (self.name)()
    }

    /// Size of the cell including its header.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether cells of this type can hold references to other cells.
    #[must_use]
    pub const fn is_compound(&self) -> bool {
        self.is_compound
    }

    /// Whether the sweeper must run a destructor for dead cells.
    #[must_use]
    pub const fn needs_destruction(&self) -> bool {
        self.needs_destruction
    }

    fn is<T: 'static>(&self) -> bool {
        (self.type_id)() == TypeId::of::<T>()
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name())
            .field("size", &self.size)
            .field("is_compound", &self.is_compound)
            .field("needs_destruction", &self.needs_destruction)
            .finish()
    }
}

struct ClassInfoOf<T>(PhantomData<T>);

impl<T: Cell> ClassInfoOf<T> {
    const INFO: &'static ClassInfo = &ClassInfo {
        name: std::any::type_name::<T>,
        type_id: TypeId::of::<T>,
        size: std::mem::size_of::<CellBox<T>>(),
        is_compound: T::IS_COMPOUND,
        needs_destruction: std::mem::needs_drop::<T>(),
        visit_children: visit_children_thunk::<T>,
        copy_backing_store: copy_backing_store_thunk::<T>,
        destroy: destroy_thunk::<T>,
    };
}

/// Returns the type descriptor for `T`.
#[must_use]
pub fn class_info<T: Cell>() -> &'static ClassInfo {
    ClassInfoOf::<T>::INFO
}

unsafe fn visit_children_thunk<T: Cell>(cell: CellPtr, visitor: &mut SlotVisitor<'_>) {
    // SAFETY: the header's class was built for `T`, so the cell is a `CellBox<T>`.
    let value = unsafe { &(*cell.as_ptr().cast::<CellBox<T>>()).value };
    value.visit_children(visitor);
}

unsafe fn copy_backing_store_thunk<T: Cell>(
    cell: CellPtr,
    visitor: &mut CopyVisitor<'_>,
    token: CopyToken,
) {
    // SAFETY: see `visit_children_thunk`.
    let value = unsafe { &(*cell.as_ptr().cast::<CellBox<T>>()).value };
    value.copy_backing_store(visitor, token);
}

unsafe fn destroy_thunk<T: Cell>(cell: CellPtr) {
    // SAFETY: the sweeper destroys each dead cell exactly once.
    unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*cell.as_ptr().cast::<CellBox<T>>()).value)) };
}

/// A type that can live in the garbage-collected heap.
///
/// The default [`visit_children`](Cell::visit_children) walks every field
/// through [`Trace`]. Types whose fields never reference other cells can set
/// `IS_COMPOUND = false`, and the marker then skips them entirely.
///
/// # Safety
///
/// `visit_children` must report every cell reference the value holds, and
/// `IS_COMPOUND` may only be `false` if the value holds none. A missed
/// reference leads to use-after-free once the referent is swept.
pub unsafe trait Cell: Trace + Send + Sync + 'static {
    /// Whether cells of this type may reference other cells.
    const IS_COMPOUND: bool = true;

    /// Reports this cell's outgoing references to the visitor.
    fn visit_children(&self, visitor: &mut SlotVisitor<'_>) {
        self.trace(visitor);
    }

    /// Relocates the backing store named by `token`.
    ///
    /// Called once per [`CopiedBuffer`](crate::CopiedBuffer) reported during
    /// marking, when the copying space decides to compact. Overrides must pass
    /// `token` to [`CopyVisitor::copy_buffer`]; an evacuated block is released
    /// once the copy phase ends.
    fn copy_backing_store(&self, visitor: &mut CopyVisitor<'_>, token: CopyToken) {
        visitor.copy_buffer(token);
    }
}

const ZAPPED: u8 = 1 << 0;
const REMEMBERED: u8 = 1 << 1;

/// The header at the start of every cell.
#[repr(C)]
pub struct CellHeader {
    class: &'static ClassInfo,
    flags: AtomicU8,
}

impl CellHeader {
    pub(crate) const fn new(class: &'static ClassInfo) -> Self {
        Self {
            class,
            flags: AtomicU8::new(0),
        }
    }

    /// The cell's type descriptor.
    #[must_use]
    pub const fn class(&self) -> &'static ClassInfo {
        self.class
    }

    /// Whether the destructor already ran.
    #[must_use]
    pub fn is_zapped(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ZAPPED != 0
    }

    pub(crate) fn zap(&self) {
        self.flags.fetch_or(ZAPPED, Ordering::AcqRel);
    }

    /// Whether a write barrier recorded this cell since it was last scanned.
    #[must_use]
    pub fn is_remembered(&self) -> bool {
        self.flags.load(Ordering::Acquire) & REMEMBERED != 0
    }

    pub(crate) fn set_remembered(&self) {
        self.flags.fetch_or(REMEMBERED, Ordering::AcqRel);
    }

    pub(crate) fn clear_remembered(&self) {
        self.flags.fetch_and(!REMEMBERED, Ordering::AcqRel);
    }
}

#[repr(C)]
pub(crate) struct CellBox<T> {
    pub(crate) header: CellHeader,
    pub(crate) value: T,
}

/// A type-erased pointer to a cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CellPtr(NonNull<CellHeader>);

// SAFETY: a `CellPtr` is an address; every access through it goes through the
// collector's own synchronization (atomic mark bits, stopped mutator).
unsafe impl Send for CellPtr {}
// SAFETY: see above.
unsafe impl Sync for CellPtr {}

impl CellPtr {
    /// Wraps a raw cell address. Returns `None` for null.
    #[must_use]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut CellHeader).map(Self)
    }

    /// The cell's address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) const fn as_ptr(self) -> *mut CellHeader {
        self.0.as_ptr()
    }

    /// Returns the cell header.
    ///
    /// # Safety
    ///
    /// The cell must be allocated and not yet swept.
    #[must_use]
    pub unsafe fn header<'a>(self) -> &'a CellHeader {
        // SAFETY: guaranteed by the caller.
        unsafe { &*self.as_ptr() }
    }

    /// Returns the cell's type descriptor.
    ///
    /// # Safety
    ///
    /// The cell must be allocated and not yet swept.
    #[must_use]
    pub unsafe fn class(self) -> &'static ClassInfo {
        // SAFETY: guaranteed by the caller.
        unsafe { self.header().class() }
    }

    /// Returns a typed reference if the cell holds a `T`.
    ///
    /// # Safety
    ///
    /// The cell must be allocated and not yet swept.
    #[must_use]
    pub unsafe fn downcast<T: Cell>(self) -> Option<CellRef<T>> {
        // SAFETY: guaranteed by the caller.
        let class = unsafe { self.class() };
        class.is::<T>().then(|| CellRef {
            ptr: self.0.cast(),
            _marker: PhantomData,
        })
    }

    pub(crate) unsafe fn visit_children(self, visitor: &mut SlotVisitor<'_>) {
        // SAFETY: the caller holds a live, marked cell.
        unsafe { (self.class().visit_children)(self, visitor) }
    }

    pub(crate) unsafe fn copy_backing_store(self, visitor: &mut CopyVisitor<'_>, token: CopyToken) {
        // SAFETY: the caller holds a live cell with a pending copy item.
        unsafe { (self.class().copy_backing_store)(self, visitor, token) }
    }

    /// Runs the destructor once and zaps the cell.
    pub(crate) unsafe fn destroy(self) {
        // SAFETY: the sweeper only destroys allocated, unmarked cells.
        let header = unsafe { self.header() };
        if header.is_zapped() {
            return;
        }
        if header.class().needs_destruction() {
            // SAFETY: not zapped, so the value is still initialized.
            unsafe { (header.class().destroy)(self) };
        }
        header.zap();
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.addr())
    }
}

/// A typed pointer to a cell holding a `T`.
///
/// `CellRef` does not root its referent. Keep it reachable from a root
/// ([`Strong`](crate::Strong), [`Local`](crate::Local), a protected value or
/// another live cell) across any point where a collection may run.
pub struct CellRef<T> {
    ptr: NonNull<CellBox<T>>,
    _marker: PhantomData<fn() -> T>,
}

// SAFETY: `CellRef<T>` hands out `&T` only; `T: Cell` is `Send + Sync`.
unsafe impl<T: Cell> Send for CellRef<T> {}
// SAFETY: see above.
unsafe impl<T: Cell> Sync for CellRef<T> {}

impl<T> Clone for CellRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CellRef<T> {}

impl<T> PartialEq for CellRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for CellRef<T> {}

impl<T> std::hash::Hash for CellRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T> fmt::Debug for CellRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef<{}>({:p})", std::any::type_name::<T>(), self.ptr)
    }
}

impl<T: Cell> CellRef<T> {
    pub(crate) const fn from_box(ptr: NonNull<CellBox<T>>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// The erased cell pointer.
    #[must_use]
    pub const fn as_cell(self) -> CellPtr {
        CellPtr(self.ptr.cast())
    }

    /// The cell as a slot value.
    #[must_use]
    pub fn as_value(self) -> Value {
        Value::cell(self.as_cell())
    }

    /// Borrows the cell's value.
    ///
    /// # Safety
    ///
    /// The cell must stay reachable from a root for all of `'a`.
    #[must_use]
    pub unsafe fn get<'a>(self) -> &'a T {
        // SAFETY: guaranteed by the caller.
        unsafe { &(*self.ptr.as_ptr()).value }
    }
}

impl<T: Cell> From<CellRef<T>> for CellPtr {
    fn from(cell: CellRef<T>) -> Self {
        cell.as_cell()
    }
}

impl<T: Cell> From<CellRef<T>> for Value {
    fn from(cell: CellRef<T>) -> Self {
        cell.as_value()
    }
}

/// A tagged word stored in reference slots.
///
/// `0` is the empty value, odd words are immediate integers and every other
/// word is a cell address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The empty value.
    pub const EMPTY: Self = Self(0);

    /// An immediate integer.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn int(value: i32) -> Self {
        Self((((value as isize) << 1) | 1) as usize)
    }

    /// A cell reference.
    #[must_use]
    pub fn cell(cell: CellPtr) -> Self {
        Self(cell.addr())
    }

    /// Reinterprets raw bits as a value.
    #[must_use]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// The raw bits.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// Whether this is the empty value.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this is an immediate integer.
    #[must_use]
    pub const fn is_int(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether this refers to a cell.
    #[must_use]
    pub const fn is_cell(self) -> bool {
        self.0 != 0 && self.0 & 1 == 0
    }

    /// The immediate integer, if any.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub const fn as_int(self) -> Option<i32> {
        if self.is_int() {
            Some(((self.0 as isize) >> 1) as i32)
        } else {
            None
        }
    }

    /// The referenced cell, if any.
    #[must_use]
    pub fn as_cell(self) -> Option<CellPtr> {
        if self.is_cell() {
            CellPtr::from_addr(self.0)
        } else {
            None
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Value::EMPTY")
        } else if let Some(int) = self.as_int() {
            write!(f, "Value::int({int})")
        } else {
            write!(f, "Value::cell({:#x})", self.0)
        }
    }
}

impl From<CellPtr> for Value {
    fn from(cell: CellPtr) -> Self {
        Self::cell(cell)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::int(value)
    }
}

/// A reference slot inside a cell.
///
/// Stores go through [`set`](WriteBarrier::set), which runs the generational
/// write barrier for the owning cell.
#[repr(transparent)]
pub struct WriteBarrier(AtomicUsize);

impl WriteBarrier {
    /// A slot holding `value`.
    ///
    /// Only use this while constructing the owner; the owner is young then
    /// and needs no barrier.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(AtomicUsize::new(value.0))
    }

    /// An empty slot.
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(Value::EMPTY)
    }

    /// Loads the slot.
    #[must_use]
    pub fn get(&self) -> Value {
        Value(self.0.load(Ordering::Acquire))
    }

    /// Stores `value` and records `owner` in the remembered set if needed.
    pub fn set(&self, heap: &Heap, owner: impl Into<CellPtr>, value: impl Into<Value>) {
        let value = value.into();
        self.0.store(value.0, Ordering::Release);
        heap.write_barrier(owner.into(), value);
    }

    /// Stores `value` without a barrier.
    ///
    /// Correct only when the owner is known to be young, or the value is not
    /// a cell.
    pub fn set_without_write_barrier(&self, value: impl Into<Value>) {
        self.0.store(value.into().0, Ordering::Release);
    }

    /// Empties the slot. Never needs a barrier.
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for WriteBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteBarrier").field(&self.get()).finish()
    }
}

/// A fixed-length run of reference slots, visited as a single mark set.
pub struct PropertyStorage {
    slots: Box<[WriteBarrier]>,
}

impl PropertyStorage {
    /// Storage with `len` empty slots.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| WriteBarrier::empty()).collect(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Loads slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Value {
        self.slots[index].get()
    }

    /// Stores into slot `index` with a write barrier on `owner`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, heap: &Heap, owner: impl Into<CellPtr>, index: usize, value: impl Into<Value>) {
        self.slots[index].set(heap, owner, value);
    }

    /// All slots.
    #[must_use]
    pub fn slots(&self) -> &[WriteBarrier] {
        &self.slots
    }
}

impl fmt::Debug for PropertyStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

macro_rules! impl_leaf_cell {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: holds no cell references.
            unsafe impl Cell for $t {
                const IS_COMPOUND: bool = false;
            }
        )*
    };
}

impl_leaf_cell! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char,
    String,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(#[allow(dead_code)] u64);

    // SAFETY: holds no references.
    unsafe impl Trace for Leaf {
        fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
    }

    // SAFETY: holds no references.
    unsafe impl Cell for Leaf {
        const IS_COMPOUND: bool = false;
    }

    struct Named(#[allow(dead_code)] String);

    // SAFETY: holds no references.
    unsafe impl Trace for Named {
        fn trace(&self, _visitor: &mut SlotVisitor<'_>) {}
    }

    // SAFETY: holds no references.
    unsafe impl Cell for Named {}

    #[test]
    fn test_value_encoding() {
        assert!(Value::EMPTY.is_empty());
        assert!(!Value::EMPTY.is_cell());
        assert_eq!(Value::int(-7).as_int(), Some(-7));
        assert_eq!(Value::int(i32::MAX).as_int(), Some(i32::MAX));
        assert_eq!(Value::int(i32::MIN).as_int(), Some(i32::MIN));
        assert!(Value::int(0).as_cell().is_none());

        let fake = Value::from_bits(0x1000);
        assert!(fake.is_cell());
        assert_eq!(fake.as_cell().map(CellPtr::addr), Some(0x1000));
        assert_eq!(fake.as_int(), None);
    }

    #[test]
    fn test_class_info_flags() {
        let leaf = class_info::<Leaf>();
        assert!(!leaf.is_compound());
        assert!(!leaf.needs_destruction());
        assert!(leaf.name().ends_with("Leaf"));
        assert_eq!(leaf.size(), std::mem::size_of::<CellBox<Leaf>>());

        let named = class_info::<Named>();
        assert!(named.is_compound());
        assert!(named.needs_destruction());
        assert!(named.is::<Named>());
        assert!(!named.is::<Leaf>());
    }

    #[test]
    fn test_header_flags() {
        let header = CellHeader::new(class_info::<Leaf>());
        assert!(!header.is_zapped());
        assert!(!header.is_remembered());
        header.set_remembered();
        assert!(header.is_remembered());
        header.zap();
        assert!(header.is_zapped());
        header.clear_remembered();
        assert!(!header.is_remembered());
        assert!(header.is_zapped());
    }

    #[test]
    fn test_write_barrier_without_barrier() {
        let slot = WriteBarrier::empty();
        assert!(slot.get().is_empty());
        slot.set_without_write_barrier(Value::int(5));
        assert_eq!(slot.get().as_int(), Some(5));
        slot.clear();
        assert!(slot.get().is_empty());
    }

    #[test]
    fn test_property_storage_starts_empty() {
        let storage = PropertyStorage::new(4);
        assert_eq!(storage.len(), 4);
        assert!((0..4).all(|i| storage.get(i).is_empty()));
        assert!(PropertyStorage::new(0).is_empty());
    }
}
