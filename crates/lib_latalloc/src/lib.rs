//! Companion crate to [`latalloc`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the program's calls into the C allocation API, time
//! them, and forward them to the allocator that would otherwise have served them.
//!
//! The latency report is produced by an `atexit` handler registered when the library is loaded.

use libc::{c_int, c_void, size_t};
use latalloc::{Interposer, NextSymbol};

static LATALLOC: Interposer<NextSymbol> = Interposer::new(NextSymbol);

extern "C" fn report_at_exit() {
    LATALLOC.shutdown();
}

extern "C" fn register_report() {
    if unsafe { libc::atexit(report_at_exit) } != 0 {
        latalloc::log!("cannot register exit handler, no latency report will be written");
    }
}

// Runs when the dynamic loader initializes this library.
#[used]
#[link_section = ".init_array"]
static REGISTER_REPORT: extern "C" fn() = register_report;

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program, forwards them to the original
/// `malloc`, and records how long they took.
///
/// # Safety
///
/// Same contract as the C library's `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    LATALLOC.malloc(size)
}

/// # Safety
///
/// Same contract as the C library's `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    LATALLOC.free(ptr)
}

/// # Safety
///
/// Same contract as the C library's `cfree`.
#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    LATALLOC.cfree(ptr)
}

/// # Safety
///
/// Same contract as the C library's `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(n: size_t, size: size_t) -> *mut c_void {
    LATALLOC.calloc(n, size)
}

/// # Safety
///
/// Same contract as the C library's `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    LATALLOC.realloc(ptr, size)
}

/// # Safety
///
/// Same contract as the C library's `memalign`.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    LATALLOC.memalign(alignment, size)
}

/// # Safety
///
/// Same contract as the C library's `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    LATALLOC.posix_memalign(out, alignment, size)
}

/// # Safety
///
/// Same contract as the C library's `aligned_alloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    LATALLOC.aligned_alloc(alignment, size)
}

/// # Safety
///
/// Same contract as the C library's `malloc_usable_size`.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    LATALLOC.malloc_usable_size(ptr)
}
