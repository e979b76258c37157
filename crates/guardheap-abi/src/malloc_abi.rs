//! Allocation entry points: malloc, realloc, free and the dup family.
//!
//! `flags` carries `AllocFlags` bits; unknown bits are ignored. Failures
//! return null after the heap has reported them, except a fatal
//! out-of-memory, which ends the process.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ptr::NonNull;

use crate::heap_state::{fail, flags_from, global_heap, site_from};

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// Allocate `size` guarded bytes attributed to `file:line`.
///
/// # Safety
///
/// `file` must be null or a static NUL-terminated string. The result must be
/// released with [`guardheap_free`] or [`guardheap_realloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_malloc(
    size: usize,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().allocate(size, site, flags_from(flags)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(err),
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Move `ptr` into a fresh block of `size` bytes.
///
/// With `HOLD_ON_REALLOC_ERROR` a failed move returns `ptr` unchanged.
///
/// # Safety
///
/// `ptr` must be null or a pointer from this heap that the caller still
/// owns. `file` as for [`guardheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_realloc(
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().reallocate(NonNull::new(ptr.cast()), size, site, flags_from(flags)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(err),
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// Release `ptr`. Returns 0 on success, -1 when the pointer was rejected.
///
/// # Safety
///
/// `ptr` must be null or a pointer from this heap. A stale pointer is
/// detected on a best-effort basis only. `file` as for [`guardheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_free(
    ptr: *mut c_void,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> c_int {
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().deallocate(NonNull::new(ptr.cast()), site, flags_from(flags)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

// ---------------------------------------------------------------------------
// memdup / strdup / strndup
// ---------------------------------------------------------------------------

/// Copy `len` bytes of `src` into a new block.
///
/// # Safety
///
/// `src` must be valid for `len` bytes (or null when `len` is 0).
/// `file` as for [`guardheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_memdup(
    src: *const c_void,
    len: usize,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> *mut c_void {
    let bytes: &[u8] = if len == 0 {
        &[]
    } else if src.is_null() {
        return std::ptr::null_mut();
    } else {
        // SAFETY: caller guarantees `len` readable bytes.
        unsafe { std::slice::from_raw_parts(src.cast(), len) }
    };
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().memdup(bytes, site, flags_from(flags)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(err),
    }
}

/// Copy a C string into a new block.
///
/// # Safety
///
/// `src` must be null or NUL-terminated. `file` as for [`guardheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_strdup(
    src: *const c_char,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> *mut c_char {
    if src.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let text = unsafe { CStr::from_ptr(src) };
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().strdup(text, site, flags_from(flags)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(err),
    }
}

/// Copy at most `max_len` characters of `src` into a new NUL-terminated block.
///
/// # Safety
///
/// `src` must be null, NUL-terminated, or valid for `max_len` bytes.
/// `file` as for [`guardheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_strndup(
    src: *const c_char,
    max_len: usize,
    file: *const c_char,
    line: u32,
    flags: u32,
) -> *mut c_char {
    if src.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: strnlen never reads past max_len bytes or the terminator.
    let len = unsafe { libc::strnlen(src, max_len) };
    // SAFETY: the first `len` bytes were just scanned.
    let bytes = unsafe { std::slice::from_raw_parts(src.cast::<u8>(), len) };
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    match global_heap().strndup(bytes, max_len, site, flags_from(flags)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(err),
    }
}
