//! Conservative root gathering.
//!
//! Raw memory (native stacks, spilled registers, interpreter stacks, scratch
//! buffers) is scanned word by word. A word is kept only if it is the exact
//! start of an allocated cell, and adding it sets the cell's mark bit, so a
//! cell found twice is reported once.
//!
//! Words pointing into the copying space pin the storage they hit instead:
//! a pinned block is never evacuated while something might still hold a raw
//! pointer into it.

use std::mem::MaybeUninit;

use sys_alloc::{Mmap, MmapOptions};

use crate::cell::CellPtr;
use crate::space::copied::CopiedSpace;
use crate::space::marked_space::CellIndex;

/// Roots held without touching the OS.
pub const INLINE_CAPACITY: usize = 128;

/// Candidate roots found by scanning raw memory.
pub struct ConservativeRoots<'a> {
    cells: &'a CellIndex,
    storage: &'a CopiedSpace,
    inline: [MaybeUninit<CellPtr>; INLINE_CAPACITY],
    overflow: Option<Mmap>,
    capacity: usize,
    len: usize,
    words_scanned: usize,
    pinned: usize,
}

impl<'a> ConservativeRoots<'a> {
    /// An empty root set resolving candidates against `cells` and `storage`.
    #[must_use]
    pub const fn new(cells: &'a CellIndex, storage: &'a CopiedSpace) -> Self {
        Self {
            cells,
            storage,
            inline: [MaybeUninit::uninit(); INLINE_CAPACITY],
            overflow: None,
            capacity: INLINE_CAPACITY,
            len: 0,
            words_scanned: 0,
            pinned: 0,
        }
    }

    /// Considers one word.
    ///
    /// Never dereferences `word` unless it lies inside a block of the heap.
    pub fn add(&mut self, word: usize) {
        self.words_scanned += 1;
        if word == 0 {
            return;
        }
        if self.storage.pin_if_storage(word) {
            self.pinned += 1;
            return;
        }
        let Some((block, index)) = self.cells.cell_for_candidate(word) else {
            return;
        };
        if block.test_and_set_marked(index) {
            return;
        }
        self.push(block.cell_at(index));
    }

    /// Considers every aligned word in `[begin, end)`.
    ///
    /// # Safety
    ///
    /// The range must be readable.
    pub unsafe fn add_range(&mut self, begin: *const u8, end: *const u8) {
        let word = std::mem::size_of::<usize>();
        let mut current = (begin as usize).next_multiple_of(word);
        let end = end as usize;
        while current + word <= end {
            // SAFETY: the caller guarantees the range is readable; volatile
            // keeps the compiler from assuming anything about stack slots.
            let value = unsafe { std::ptr::read_volatile(current as *const usize) };
            self.add(value);
            current += word;
        }
    }

    /// Considers every word of `words`.
    pub fn add_words(&mut self, words: &[usize]) {
        for &word in words {
            self.add(word);
        }
    }

    fn push(&mut self, cell: CellPtr) {
        if self.len == self.capacity {
            self.grow();
        }
        match &self.overflow {
            // SAFETY: `len < capacity`, and the mapping holds `capacity` roots.
            Some(map) => unsafe { map.ptr().cast::<CellPtr>().add(self.len).write(cell) },
            None => self.inline[self.len] = MaybeUninit::new(cell),
        }
        self.len += 1;
    }

    fn grow(&mut self) {
        let capacity = self.capacity * 2;
        let bytes = (capacity * std::mem::size_of::<CellPtr>()).next_multiple_of(sys_alloc::page_size());
        // SAFETY: a fresh anonymous mapping with no address hint.
        let map = match unsafe { MmapOptions::new().len(bytes).map_anon() } {
            Ok(map) => map,
            Err(err) => panic!("failed to map {bytes} bytes for conservative roots: {err}"),
        };
        // SAFETY: both buffers hold at least `len` roots and do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.roots().as_ptr(), map.ptr().cast::<CellPtr>(), self.len);
        }
        self.overflow = Some(map);
        self.capacity = capacity;
    }

    /// The roots found so far, each one marked.
    #[must_use]
    pub fn roots(&self) -> &[CellPtr] {
        let ptr = match &self.overflow {
            Some(map) => map.ptr().cast::<CellPtr>().cast_const(),
            None => self.inline.as_ptr().cast::<CellPtr>(),
        };
        // SAFETY: the first `len` entries are initialized.
        unsafe { std::slice::from_raw_parts(ptr, self.len) }
    }

    /// Number of roots found.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no root was found.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Words examined, roots or not.
    #[must_use]
    pub const fn words_scanned(&self) -> usize {
        self.words_scanned
    }

    /// Words that pinned copying-space storage.
    #[must_use]
    pub const fn pinned_count(&self) -> usize {
        self.pinned
    }

    /// Current capacity before the next growth.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for ConservativeRoots<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConservativeRoots")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("words_scanned", &self.words_scanned)
            .finish_non_exhaustive()
    }
}
