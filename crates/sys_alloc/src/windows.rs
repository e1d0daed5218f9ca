use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
    MEM_RESERVE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
};

use crate::Protection;

fn system_info() -> &'static (usize, usize) {
    static INFO: OnceLock<(usize, usize)> = OnceLock::new();
    INFO.get_or_init(|| {
        // SAFETY: GetSystemInfo fills the zeroed struct.
        let info = unsafe {
            let mut info: SYSTEM_INFO = mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        let page = match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        };
        let granularity = match info.dwAllocationGranularity as usize {
            0 => 64 * 1024,
            size => size,
        };
        (page, granularity)
    })
}

pub fn page_size() -> usize {
    system_info().0
}

pub fn allocation_granularity() -> usize {
    system_info().1
}

/// 0 when unknown.
pub fn physical_memory() -> usize {
    // SAFETY: the struct is zeroed and its length field set as the API requires.
    unsafe {
        let mut status: MEMORYSTATUSEX = mem::zeroed();
        status.dwLength = mem::size_of::<MEMORYSTATUSEX>() as u32;
        if GlobalMemoryStatusEx(&mut status) == 0 {
            return 0;
        }
        usize::try_from(status.ullTotalPhys).unwrap_or(usize::MAX)
    }
}

fn check(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
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
    pub unsafe fn map_anon(len: usize, _populate: bool) -> io::Result<Self> {
        // SAFETY: reserving and committing fresh pages aliases nothing.
        let addr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        let base = ptr::NonNull::new(addr.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { base, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    fn range(&self, offset: usize) -> *mut c_void {
        self.ptr().wrapping_add(offset).cast()
    }

    /// # Safety
    ///
    /// The range must lie inside the mapping and stay untouched afterwards.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: the caller keeps the range inside the mapping.
        check(unsafe { VirtualFree(self.range(offset), len, MEM_DECOMMIT) })
    }

    /// # Safety
    ///
    /// The range must lie inside the mapping.
    pub unsafe fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let flags: PAGE_PROTECTION_FLAGS = match protection {
            Protection::None => PAGE_NOACCESS,
            Protection::Read => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
        };
        let mut previous: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: the caller keeps the range inside the mapping.
        check(unsafe { VirtualProtect(self.range(offset), len, flags, &mut previous) })
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        // SAFETY: the whole reservation is owned; MEM_RELEASE takes a zero size.
        unsafe { VirtualFree(self.base.as_ptr().cast(), 0, MEM_RELEASE) };
    }
}
