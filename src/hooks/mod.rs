//! Allocation-symbol interception: the hook table, the C shims installed
//! into patched indirection slots, and the thread-local re-entrancy guard.
//!
//! Each shim calls the original function resolved through `RTLD_NEXT`, then
//! reports the event to the tracker. Tracing failures never propagate to the
//! caller: the record is dropped and counted. Allocations made while the
//! guard is held (the tracker's own bookkeeping, interpreter hook bodies)
//! bypass recording entirely.

#[cfg(target_os = "linux")]
pub mod elf;
#[cfg(target_os = "macos")]
pub mod macho;
pub mod pymalloc;

use std::cell::Cell;
use std::ffi::CStr;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::{c_char, c_int, c_void, off_t, size_t};
use recorder_errors::RecorderResult;

use crate::records::AllocatorKind;
use crate::tracker;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Scoped re-entrancy guard. Only one level of hook runs per thread; nested
/// entries (the allocator called from our own bookkeeping, or from a signal
/// handler interrupting a hook) fall through to the original function.
pub struct RecursionGuard(());

impl RecursionGuard {
    /// `try_with` keeps allocator calls made during thread teardown (after
    /// this thread's TLS was destroyed) on the pass-through path.
    pub fn acquire() -> Option<Self> {
        IN_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(RecursionGuard(()))
                }
            })
            .unwrap_or(None)
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// One interceptable allocator symbol: its name and the shim that replaces it.
pub struct HookedSymbol {
    pub name: &'static CStr,
    pub shim: usize,
}

macro_rules! original_slots {
    ($($slot:ident),+ $(,)?) => {
        $(static $slot: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());)+
    };
}

original_slots!(
    REAL_MALLOC,
    REAL_FREE,
    REAL_CALLOC,
    REAL_REALLOC,
    REAL_POSIX_MEMALIGN,
    REAL_ALIGNED_ALLOC,
    REAL_VALLOC,
    REAL_MEMALIGN,
    REAL_PVALLOC,
    REAL_MMAP,
    REAL_MUNMAP,
    REAL_DLOPEN,
);

/// Resolve the slot to `Option` of the typed entry point; fn pointers are
/// never null, so a failed lookup stays `None` instead of becoming one.
macro_rules! original {
    ($slot:ident, $name:literal, $sig:ty) => {{
        let mut ptr = $slot.load(Ordering::Relaxed);
        if ptr.is_null() {
            ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, $name.as_ptr()) };
            $slot.store(ptr, Ordering::Relaxed);
        }
        unsafe { std::mem::transmute::<*mut c_void, Option<$sig>>(ptr) }
    }};
}

/// Resolve every original entry point before any slot is overwritten, so a
/// shim never races its own resolution.
pub fn ensure_originals_resolved() {
    let _ = original!(REAL_MALLOC, c"malloc", unsafe extern "C" fn(size_t) -> *mut c_void);
    let _ = original!(REAL_FREE, c"free", unsafe extern "C" fn(*mut c_void));
    let _ = original!(
        REAL_CALLOC,
        c"calloc",
        unsafe extern "C" fn(size_t, size_t) -> *mut c_void
    );
    let _ = original!(
        REAL_REALLOC,
        c"realloc",
        unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void
    );
    let _ = original!(
        REAL_POSIX_MEMALIGN,
        c"posix_memalign",
        unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int
    );
    let _ = original!(
        REAL_ALIGNED_ALLOC,
        c"aligned_alloc",
        unsafe extern "C" fn(size_t, size_t) -> *mut c_void
    );
    let _ = original!(REAL_VALLOC, c"valloc", unsafe extern "C" fn(size_t) -> *mut c_void);
    #[cfg(target_os = "linux")]
    {
        let _ = original!(
            REAL_MEMALIGN,
            c"memalign",
            unsafe extern "C" fn(size_t, size_t) -> *mut c_void
        );
        let _ = original!(REAL_PVALLOC, c"pvalloc", unsafe extern "C" fn(size_t) -> *mut c_void);
    }
    let _ = original!(
        REAL_MMAP,
        c"mmap",
        unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void
    );
    let _ = original!(
        REAL_MUNMAP,
        c"munmap",
        unsafe extern "C" fn(*mut c_void, size_t) -> c_int
    );
    let _ = original!(
        REAL_DLOPEN,
        c"dlopen",
        unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void
    );
}

pub unsafe extern "C" fn malloc_shim(size: size_t) -> *mut c_void {
    let Some(real) = original!(REAL_MALLOC, c"malloc", unsafe extern "C" fn(size_t) -> *mut c_void)
    else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(size);
    };
    let ptr = real(size);
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Malloc, ptr as u64, size as u64);
    }
    ptr
}

pub unsafe extern "C" fn free_shim(ptr: *mut c_void) {
    let Some(real) = original!(REAL_FREE, c"free", unsafe extern "C" fn(*mut c_void)) else {
        return;
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(ptr);
    };
    if !ptr.is_null() {
        tracker::record_free(AllocatorKind::Free, ptr as u64);
    }
    real(ptr);
}

pub unsafe extern "C" fn calloc_shim(count: size_t, size: size_t) -> *mut c_void {
    let Some(real) = original!(
        REAL_CALLOC,
        c"calloc",
        unsafe extern "C" fn(size_t, size_t) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(count, size);
    };
    let ptr = real(count, size);
    if !ptr.is_null() {
        tracker::record_allocation(
            AllocatorKind::Calloc,
            ptr as u64,
            (count as u64).saturating_mul(size as u64),
        );
    }
    ptr
}

pub unsafe extern "C" fn realloc_shim(old: *mut c_void, size: size_t) -> *mut c_void {
    let Some(real) = original!(
        REAL_REALLOC,
        c"realloc",
        unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(old, size);
    };
    let ptr = real(old, size);
    if !ptr.is_null() {
        if !old.is_null() {
            tracker::record_free(AllocatorKind::Free, old as u64);
        }
        tracker::record_allocation(AllocatorKind::Realloc, ptr as u64, size as u64);
    }
    ptr
}

pub unsafe extern "C" fn posix_memalign_shim(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let Some(real) = original!(
        REAL_POSIX_MEMALIGN,
        c"posix_memalign",
        unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int
    ) else {
        return libc::ENOMEM;
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(out, alignment, size);
    };
    let rc = real(out, alignment, size);
    if rc == 0 && !out.is_null() {
        tracker::record_allocation(AllocatorKind::PosixMemalign, (*out) as u64, size as u64);
    }
    rc
}

pub unsafe extern "C" fn aligned_alloc_shim(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = original!(
        REAL_ALIGNED_ALLOC,
        c"aligned_alloc",
        unsafe extern "C" fn(size_t, size_t) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(alignment, size);
    };
    let ptr = real(alignment, size);
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::AlignedAlloc, ptr as u64, size as u64);
    }
    ptr
}

pub unsafe extern "C" fn valloc_shim(size: size_t) -> *mut c_void {
    let Some(real) = original!(REAL_VALLOC, c"valloc", unsafe extern "C" fn(size_t) -> *mut c_void)
    else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(size);
    };
    let ptr = real(size);
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Valloc, ptr as u64, size as u64);
    }
    ptr
}

#[cfg(target_os = "linux")]
pub unsafe extern "C" fn memalign_shim(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = original!(
        REAL_MEMALIGN,
        c"memalign",
        unsafe extern "C" fn(size_t, size_t) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(alignment, size);
    };
    let ptr = real(alignment, size);
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Memalign, ptr as u64, size as u64);
    }
    ptr
}

#[cfg(target_os = "linux")]
pub unsafe extern "C" fn pvalloc_shim(size: size_t) -> *mut c_void {
    let Some(real) = original!(REAL_PVALLOC, c"pvalloc", unsafe extern "C" fn(size_t) -> *mut c_void)
    else {
        return std::ptr::null_mut();
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(size);
    };
    let ptr = real(size);
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Pvalloc, ptr as u64, size as u64);
    }
    ptr
}

pub unsafe extern "C" fn mmap_shim(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let Some(real) = original!(
        REAL_MMAP,
        c"mmap",
        unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void
    ) else {
        return libc::MAP_FAILED;
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(addr, length, prot, flags, fd, offset);
    };
    let ptr = real(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
        tracker::record_allocation(AllocatorKind::Mmap, ptr as u64, length as u64);
    }
    ptr
}

pub unsafe extern "C" fn munmap_shim(addr: *mut c_void, length: size_t) -> c_int {
    let Some(real) = original!(
        REAL_MUNMAP,
        c"munmap",
        unsafe extern "C" fn(*mut c_void, size_t) -> c_int
    ) else {
        return -1;
    };
    let Some(_guard) = RecursionGuard::acquire() else {
        return real(addr, length);
    };
    let rc = real(addr, length);
    if rc == 0 {
        tracker::record_free(AllocatorKind::Munmap, addr as u64);
    }
    rc
}

/// `dlopen` is intercepted so images loaded while patched get their slots
/// rewritten too. The call itself is never recorded.
pub unsafe extern "C" fn dlopen_shim(filename: *const c_char, flags: c_int) -> *mut c_void {
    let Some(real) = original!(
        REAL_DLOPEN,
        c"dlopen",
        unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let guard = RecursionGuard::acquire();
    let handle = real(filename, flags);
    if guard.is_some() && !handle.is_null() {
        tracker::on_loader_change();
    }
    handle
}

/// The symbols the patcher rewrites, with their shims.
pub fn hooked_symbols() -> Vec<HookedSymbol> {
    let mut table = vec![
        HookedSymbol { name: c"malloc", shim: malloc_shim as usize },
        HookedSymbol { name: c"free", shim: free_shim as usize },
        HookedSymbol { name: c"calloc", shim: calloc_shim as usize },
        HookedSymbol { name: c"realloc", shim: realloc_shim as usize },
        HookedSymbol {
            name: c"posix_memalign",
            shim: posix_memalign_shim as usize,
        },
        HookedSymbol {
            name: c"aligned_alloc",
            shim: aligned_alloc_shim as usize,
        },
        HookedSymbol { name: c"valloc", shim: valloc_shim as usize },
        HookedSymbol { name: c"mmap", shim: mmap_shim as usize },
        HookedSymbol { name: c"munmap", shim: munmap_shim as usize },
        HookedSymbol { name: c"dlopen", shim: dlopen_shim as usize },
    ];
    #[cfg(target_os = "linux")]
    {
        table.push(HookedSymbol { name: c"memalign", shim: memalign_shim as usize });
        table.push(HookedSymbol { name: c"pvalloc", shim: pvalloc_shim as usize });
    }
    table
}

/// Path of the shared object this crate is loaded from; the patcher skips it
/// so our own allocator calls keep reaching libc directly.
pub fn own_image_name() -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(malloc_shim as *const c_void, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(info.dli_fname) };
    Some(name.to_string_lossy().into_owned())
}

/// Rewrite the indirection tables of every loaded image.
pub fn overwrite_symbols() -> RecorderResult<()> {
    ensure_originals_resolved();
    #[cfg(target_os = "linux")]
    {
        elf::overwrite_symbols()
    }
    #[cfg(target_os = "macos")]
    {
        macho::overwrite_symbols()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(recorder_errors::enverr!(
            recorder_errors::ErrorCode::PatchFailed,
            "symbol interception is not supported on this platform"
        ))
    }
}

/// Invert every slot edit made by [`overwrite_symbols`].
pub fn restore_symbols() {
    #[cfg(target_os = "linux")]
    elf::restore_symbols();
    #[cfg(target_os = "macos")]
    macho::restore_symbols();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_guard_is_exclusive_per_thread() {
        let guard = RecursionGuard::acquire().expect("first acquire");
        assert!(RecursionGuard::acquire().is_none());
        drop(guard);
        assert!(RecursionGuard::acquire().is_some());
    }

    #[test]
    fn hook_table_covers_the_allocator_family() {
        let names: Vec<&str> = hooked_symbols()
            .iter()
            .map(|symbol| symbol.name.to_str().expect("utf8"))
            .collect();
        for required in ["malloc", "free", "calloc", "realloc", "posix_memalign", "mmap"] {
            assert!(names.contains(&required), "missing {required}");
        }
        assert!(hooked_symbols().iter().all(|symbol| symbol.shim != 0));
    }

    #[test]
    fn shims_pass_through_to_the_real_allocator() {
        // The tracker is inactive here, so the shims must behave exactly
        // like the functions they wrap.
        unsafe {
            let ptr = malloc_shim(64);
            assert!(!ptr.is_null());
            let grown = realloc_shim(ptr, 128);
            assert!(!grown.is_null());
            free_shim(grown);

            let zeroed = calloc_shim(4, 8) as *mut u8;
            assert!(!zeroed.is_null());
            assert_eq!(std::slice::from_raw_parts(zeroed, 32), &[0u8; 32]);
            free_shim(zeroed as *mut c_void);
        }
    }

    #[test]
    fn own_image_is_resolvable() {
        let name = own_image_name().expect("dladdr");
        assert!(!name.is_empty());
    }
}
