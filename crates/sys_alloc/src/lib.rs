//! OS memory primitives for the collector.
//!
//! Anonymous page mappings with decommit and protection changes, plus the
//! page size, allocation granularity and physical memory size the heap
//! sizes itself with. This is the only layer that reports failures as
//! [`io::Result`]; callers above it treat a failed mapping as fatal.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Fallback when the platform will not report its memory size.
const DEFAULT_PHYSICAL_MEMORY: usize = 512 * 1024 * 1024;

/// Installed physical memory in bytes.
///
/// Falls back to 512MB when the platform refuses to answer.
#[must_use]
pub fn physical_memory() -> usize {
    match os::physical_memory() {
        0 => DEFAULT_PHYSICAL_MEMORY,
        bytes => bytes,
    }
}

/// Alignment of addresses handed out by the OS mapping call.
///
/// 64KB on Windows; the page size elsewhere.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access protection for a range of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults.
    None,
    /// Read-only access.
    Read,
    /// Read and write access.
    ReadWrite,
}

/// An anonymous, zero-filled, read-write mapping. Unmapped on drop.
pub struct Mmap {
    inner: os::MmapInner,
}

// SAFETY: the mapping is plain memory owned by this handle; synchronizing
// access to its contents is the user's business.
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Start of the mapping, aligned to [`allocation_granularity`].
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mapping is empty. Never true for a successful map.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `addr` falls inside the mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr - start < self.len()
    }

    /// Hands the pages of `[offset, offset + len)` back to the OS.
    ///
    /// The range stays reserved. On Unix it reads back as zeroes on the next
    /// touch; on Windows it must not be touched again.
    ///
    /// # Errors
    ///
    /// Fails if the range is unaligned or out of bounds, or if the OS call
    /// fails.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside this mapping.
        unsafe { self.inner.decommit(offset, len) }
    }

    /// Changes the protection of `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// Fails if the range is unaligned or out of bounds, or if the OS call
    /// fails.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside this mapping.
        unsafe { self.inner.protect(offset, len, protection) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len());
        if !in_bounds || offset % page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned and inside the mapping",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Builder for [`Mmap`].
///
/// # Example
///
/// ```
/// let map = unsafe { sys_alloc::MmapOptions::new().len(4096).map_anon() }.unwrap();
/// assert!(map.len() >= 4096);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Options for an empty mapping; set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Length in bytes, rounded up to the page size when mapping.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Prefaults the page tables (`MAP_POPULATE` on Linux, no-op elsewhere).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Maps fresh anonymous memory.
    ///
    /// # Safety
    ///
    /// Pointers derived from the mapping must not outlive the returned
    /// [`Mmap`].
    ///
    /// # Errors
    ///
    /// Fails for a zero length or when the OS refuses the mapping.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be non-zero",
            ));
        }
        let len = self.len.next_multiple_of(page_size());
        // SAFETY: forwarded from the caller.
        let inner = unsafe { os::MmapInner::map_anon(len, self.populate)? };
        Ok(Mmap { inner })
    }
}
