//! Conservative scanning of the collecting thread's native stack.
//!
//! Callee-saved registers are spilled into a stack array first so that a
//! pointer living only in a register is seen too. The stack is then walked
//! from the current stack pointer up to its origin.

use crate::gc::ConservativeRoots;

/// Bounds of a thread's stack. Stacks grow down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address, where the stack starts.
    pub origin: usize,
    /// Lowest usable address.
    pub limit: usize,
}

impl StackBounds {
    /// Bounds of the calling thread's stack, if the platform reports them.
    #[cfg(all(target_os = "linux", not(miri)))]
    #[must_use]
    pub fn current() -> Option<Self> {
        use libc::{
            pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
            pthread_self,
        };

        // SAFETY: `attr` is initialized by `pthread_getattr_np` before use and
        // destroyed exactly once.
        unsafe {
            let mut attr: pthread_attr_t = std::mem::zeroed();
            if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
                return None;
            }
            let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
            let mut stacksize: libc::size_t = 0;
            let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
            pthread_attr_destroy(&raw mut attr);
            if ret != 0 {
                return None;
            }
            Some(Self {
                origin: stackaddr as usize + stacksize,
                limit: stackaddr as usize,
            })
        }
    }

    /// Bounds of the calling thread's stack, if the platform reports them.
    #[cfg(all(target_vendor = "apple", not(miri)))]
    #[must_use]
    pub fn current() -> Option<Self> {
        // SAFETY: both calls only read the calling thread's attributes.
        unsafe {
            let thread = libc::pthread_self();
            let origin = libc::pthread_get_stackaddr_np(thread) as usize;
            let size = libc::pthread_get_stacksize_np(thread);
            Some(Self {
                origin,
                limit: origin - size,
            })
        }
    }

    /// Bounds of the calling thread's stack, if the platform reports them.
    #[cfg(all(windows, not(miri)))]
    #[must_use]
    pub fn current() -> Option<Self> {
        use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

        let mut low = 0usize;
        let mut high = 0usize;
        // SAFETY: both out-pointers refer to live locals.
        unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
        Some(Self {
            origin: high,
            limit: low,
        })
    }

    /// Bounds of the calling thread's stack, if the platform reports them.
    #[cfg(any(
        miri,
        not(any(target_os = "linux", target_vendor = "apple", windows))
    ))]
    #[must_use]
    pub const fn current() -> Option<Self> {
        None
    }

    /// Whether `addr` lies inside the stack.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.limit <= addr && addr < self.origin
    }
}

/// Copies callee-saved registers into an array on the caller's frame.
#[inline(never)]
fn spill_registers() -> [usize; 8] {
    #[allow(unused_mut)]
    let mut regs = [0usize; 8];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: only reads registers into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    // SAFETY: only reads registers into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
        );
    }
    std::hint::black_box(regs)
}

/// Adds every word of the calling thread's registers and live stack.
///
/// Does nothing where stack bounds are unknown.
#[inline(never)]
pub fn gather_from_current_thread(roots: &mut ConservativeRoots<'_>) {
    let Some(bounds) = StackBounds::current() else {
        return;
    };
    let registers = spill_registers();
    roots.add_words(&registers);

    let marker = 0usize;
    let sp = std::ptr::from_ref(std::hint::black_box(&marker)) as usize;
    debug_assert!(bounds.contains(sp), "stack pointer {sp:#x} outside {bounds:?}");
    // SAFETY: everything from the current frame up to the origin is the live,
    // readable part of this thread's stack.
    unsafe { roots.add_range(sp as *const u8, bounds.origin as *const u8) };
}

/// Zeroes callee-saved registers so stale pointers are not found as roots.
///
/// # Safety
///
/// The caller must not rely on values in callee-saved registers across
/// this call being anything but what the compiler saved itself.
#[inline(never)]
pub unsafe fn clear_registers() {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: the clobbered registers are declared as outputs.
    unsafe {
        std::arch::asm!(
            "xor r12, r12",
            "xor r13, r13",
            "xor r14, r14",
            "xor r15, r15",
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    std::hint::black_box(());
}
