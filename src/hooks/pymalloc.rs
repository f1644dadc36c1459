//! Interpreter allocator tracing: wraps the three CPython allocator domains
//! (`raw`, `mem`, `object`) behind recording shims when the policy asks for
//! Python-allocator events. The previous allocators are kept so the wrapper
//! delegates to whatever was installed before us, pymalloc included.

use std::sync::Mutex;

use libc::c_void;
use pyo3::ffi;
use pyo3::Python;

use super::RecursionGuard;
use crate::records::AllocatorKind;
use crate::tracker;

struct SavedDomain {
    domain: ffi::PyMemAllocatorDomain,
    /// Leaked so the wrapper's `ctx` stays valid for the process lifetime.
    previous: &'static ffi::PyMemAllocatorEx,
}

// PyMemAllocatorEx holds raw pointers; the saved copies are only touched
// under the mutex and from allocator callbacks that never outlive them.
unsafe impl Send for SavedDomain {}

static INSTALLED: Mutex<Vec<SavedDomain>> = Mutex::new(Vec::new());

fn previous_of(ctx: *mut c_void) -> &'static ffi::PyMemAllocatorEx {
    unsafe { &*(ctx as *const ffi::PyMemAllocatorEx) }
}

extern "C" fn wrapped_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let previous = previous_of(ctx);
    let ptr = match previous.malloc {
        Some(malloc) => malloc(previous.ctx, size),
        None => return std::ptr::null_mut(),
    };
    if !ptr.is_null() {
        if let Some(_guard) = RecursionGuard::acquire() {
            tracker::record_allocation(AllocatorKind::PymallocMalloc, ptr as u64, size as u64);
        }
    }
    ptr
}

extern "C" fn wrapped_calloc(ctx: *mut c_void, nelem: usize, elsize: usize) -> *mut c_void {
    let previous = previous_of(ctx);
    let ptr = match previous.calloc {
        Some(calloc) => calloc(previous.ctx, nelem, elsize),
        None => return std::ptr::null_mut(),
    };
    if !ptr.is_null() {
        if let Some(_guard) = RecursionGuard::acquire() {
            tracker::record_allocation(
                AllocatorKind::PymallocCalloc,
                ptr as u64,
                (nelem as u64).saturating_mul(elsize as u64),
            );
        }
    }
    ptr
}

extern "C" fn wrapped_realloc(ctx: *mut c_void, old: *mut c_void, size: usize) -> *mut c_void {
    let previous = previous_of(ctx);
    let ptr = match previous.realloc {
        Some(realloc) => realloc(previous.ctx, old, size),
        None => return std::ptr::null_mut(),
    };
    if !ptr.is_null() {
        if let Some(_guard) = RecursionGuard::acquire() {
            if !old.is_null() {
                tracker::record_free(AllocatorKind::PymallocFree, old as u64);
            }
            tracker::record_allocation(AllocatorKind::PymallocRealloc, ptr as u64, size as u64);
        }
    }
    ptr
}

extern "C" fn wrapped_free(ctx: *mut c_void, ptr: *mut c_void) {
    let previous = previous_of(ctx);
    if !ptr.is_null() {
        if let Some(_guard) = RecursionGuard::acquire() {
            tracker::record_free(AllocatorKind::PymallocFree, ptr as u64);
        }
    }
    if let Some(free) = previous.free {
        free(previous.ctx, ptr);
    }
}

const DOMAINS: [ffi::PyMemAllocatorDomain; 3] = [
    ffi::PyMemAllocatorDomain::PYMEM_DOMAIN_RAW,
    ffi::PyMemAllocatorDomain::PYMEM_DOMAIN_MEM,
    ffi::PyMemAllocatorDomain::PYMEM_DOMAIN_OBJ,
];

/// Install recording wrappers over all three allocator domains.
pub fn install(_py: Python<'_>) {
    let mut installed = INSTALLED.lock().expect("pymalloc hooks lock");
    if !installed.is_empty() {
        return;
    }
    for domain in DOMAINS {
        let mut previous = ffi::PyMemAllocatorEx {
            ctx: std::ptr::null_mut(),
            malloc: None,
            calloc: None,
            realloc: None,
            free: None,
        };
        unsafe { ffi::PyMem_GetAllocator(domain, &mut previous) };
        let previous: &'static ffi::PyMemAllocatorEx = Box::leak(Box::new(previous));

        let mut wrapper = ffi::PyMemAllocatorEx {
            ctx: previous as *const ffi::PyMemAllocatorEx as *mut c_void,
            malloc: Some(wrapped_malloc),
            calloc: Some(wrapped_calloc),
            realloc: Some(wrapped_realloc),
            free: Some(wrapped_free),
        };
        unsafe { ffi::PyMem_SetAllocator(domain, &mut wrapper) };
        installed.push(SavedDomain { domain, previous });
    }
}

/// Restore the allocators that were active before [`install`].
pub fn remove(_py: Python<'_>) {
    let mut installed = INSTALLED.lock().expect("pymalloc hooks lock");
    for saved in installed.drain(..) {
        let mut restored = ffi::PyMemAllocatorEx {
            ctx: saved.previous.ctx,
            malloc: saved.previous.malloc,
            calloc: saved.previous.calloc,
            realloc: saved.previous.realloc,
            free: saved.previous.free,
        };
        unsafe { ffi::PyMem_SetAllocator(saved.domain, &mut restored) };
    }
}
