use std::io;
use std::ptr;
use std::sync::OnceLock;

use crate::Protection;

#[cfg(any(target_os = "linux", target_os = "android"))]
const POPULATE_FLAG: libc::c_int = libc::MAP_POPULATE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POPULATE_FLAG: libc::c_int = 0;

pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
    })
}

/// 0 when unknown.
pub fn physical_memory() -> usize {
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    usize::try_from(pages).map_or(0, |pages| pages.saturating_mul(page_size()))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub struct MmapInner {
    base: ptr::NonNull<u8>,
    len: usize,
}

impl MmapInner {
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, populate: bool) -> io::Result<Self> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        if populate {
            flags |= POPULATE_FLAG;
        }
        // SAFETY: a fresh private anonymous mapping aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = ptr::NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { base, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    fn range(&self, offset: usize) -> *mut libc::c_void {
        self.ptr().wrapping_add(offset).cast()
    }

    /// # Safety
    ///
    /// The range must lie inside the mapping.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: the caller keeps the range inside the mapping.
        check(unsafe { libc::madvise(self.range(offset), len, libc::MADV_DONTNEED) })
    }

    /// # Safety
    ///
    /// The range must lie inside the mapping.
    pub unsafe fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let prot = match protection {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };
        // SAFETY: the caller keeps the range inside the mapping.
        check(unsafe { libc::mprotect(self.range(offset), len, prot) })
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned and no longer referenced.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}
