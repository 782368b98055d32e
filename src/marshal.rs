//! Native memory and string primitives.
//!
//! Every read/write here goes through unaligned pointer access at an explicit
//! byte offset, so callers describe native struct layouts with offsets
//! computed by [`next_offset_of`] rather than with Rust struct definitions.

use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::provider::{Sqlite3Api, sqlite3_vtab, sqlite3_vtab_cursor};

/// Upper bound on a NUL-terminator scan over engine-owned text.
pub const MAX_NATIVE_STRING_LEN: usize = 0x3fff_ffff;

/// Offset of the field following one of `size` bytes at `offset`, aligned
/// to `align` (the next field's natural alignment).
pub const fn next_offset_of(offset: usize, size: usize, align: usize) -> usize {
    let end = offset + size;
    if align <= 1 {
        return end;
    }
    end.div_ceil(align) * align
}

/// Allocate `size` bytes with the engine allocator.
pub fn allocate<P: Sqlite3Api>(api: &P, size: usize) -> Option<NonNull<c_void>> {
    NonNull::new(unsafe { api.malloc(size) })
}

/// Allocate `size` zeroed bytes with the engine allocator.
pub fn allocate_zeroed<P: Sqlite3Api>(api: &P, size: usize) -> Option<NonNull<c_void>> {
    let ptr = allocate(api, size)?;
    unsafe { core::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0, size) };
    Some(ptr)
}

/// Release memory obtained from [`allocate`]. Null is ignored.
pub fn free<P: Sqlite3Api>(api: &P, ptr: *mut c_void) {
    if !ptr.is_null() {
        unsafe { api.free(ptr) };
    }
}

/// # Safety
/// `base + offset` must be readable for 4 bytes.
pub unsafe fn read_i32(base: *const c_void, offset: usize) -> i32 {
    unsafe { ((base as *const u8).add(offset) as *const i32).read_unaligned() }
}

/// # Safety
/// `base + offset` must be writable for 4 bytes.
pub unsafe fn write_i32(base: *mut c_void, offset: usize, value: i32) {
    unsafe { ((base as *mut u8).add(offset) as *mut i32).write_unaligned(value) }
}

/// # Safety
/// `base + offset` must be readable for 8 bytes.
pub unsafe fn read_i64(base: *const c_void, offset: usize) -> i64 {
    unsafe { ((base as *const u8).add(offset) as *const i64).read_unaligned() }
}

/// # Safety
/// `base + offset` must be writable for 8 bytes.
pub unsafe fn write_i64(base: *mut c_void, offset: usize, value: i64) {
    unsafe { ((base as *mut u8).add(offset) as *mut i64).write_unaligned(value) }
}

/// # Safety
/// `base + offset` must be readable for 8 bytes.
pub unsafe fn read_f64(base: *const c_void, offset: usize) -> f64 {
    unsafe { ((base as *const u8).add(offset) as *const f64).read_unaligned() }
}

/// # Safety
/// `base + offset` must be writable for 8 bytes.
pub unsafe fn write_f64(base: *mut c_void, offset: usize, value: f64) {
    unsafe { ((base as *mut u8).add(offset) as *mut f64).write_unaligned(value) }
}

/// # Safety
/// `base + offset` must be readable for one pointer.
pub unsafe fn read_ptr(base: *const c_void, offset: usize) -> *mut c_void {
    unsafe { ((base as *const u8).add(offset) as *const *mut c_void).read_unaligned() }
}

/// # Safety
/// `base + offset` must be writable for one pointer.
pub unsafe fn write_ptr(base: *mut c_void, offset: usize, value: *mut c_void) {
    unsafe { ((base as *mut u8).add(offset) as *mut *mut c_void).write_unaligned(value) }
}

/// # Safety
/// `base + offset` must be readable for 1 byte.
pub unsafe fn read_u8(base: *const c_void, offset: usize) -> u8 {
    unsafe { (base as *const u8).add(offset).read() }
}

/// # Safety
/// `base + offset` must be writable for 1 byte.
pub unsafe fn write_u8(base: *mut c_void, offset: usize, value: u8) {
    unsafe { (base as *mut u8).add(offset).write(value) }
}

/// Decode UTF-8 bytes, replacing invalid sequences.
pub fn utf8_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Encode `value` as NUL-terminated UTF-8 bytes.
pub fn string_to_utf8z(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}

/// Length of a NUL-terminated native string, bounded by
/// [`MAX_NATIVE_STRING_LEN`].
///
/// # Safety
/// `ptr` must be null or point to readable memory up to the terminator or
/// the limit, whichever comes first.
pub unsafe fn native_strlen(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    unsafe { libc::strnlen(ptr as *const c_char, MAX_NATIVE_STRING_LEN) }
}

/// Decode a native UTF-8 buffer. With `len` of `None` the buffer is
/// NUL-terminated. Returns `None` for a null pointer.
///
/// # Safety
/// `ptr` must be null or valid for `len` bytes (or up to its terminator).
pub unsafe fn utf8_from_native(ptr: *const u8, len: Option<usize>) -> Option<String> {
    let bytes = unsafe { native_bytes(ptr, len) }?;
    Some(utf8_to_string(bytes))
}

/// Borrow a native UTF-8 buffer without copying; `None` for a null pointer
/// or invalid UTF-8.
///
/// # Safety
/// Same as [`utf8_from_native`]; the borrow must not outlive the buffer.
pub unsafe fn str_from_native<'a>(ptr: *const u8, len: Option<usize>) -> Option<&'a str> {
    let bytes = unsafe { native_bytes(ptr, len) }?;
    core::str::from_utf8(bytes).ok()
}

unsafe fn native_bytes<'a>(ptr: *const u8, len: Option<usize>) -> Option<&'a [u8]> {
    if ptr.is_null() {
        return None;
    }
    let len = match len {
        Some(len) => len,
        None => unsafe { native_strlen(ptr) },
    };
    Some(unsafe { core::slice::from_raw_parts(ptr, len) })
}

/// Copy `value` into an engine-allocated NUL-terminated buffer. Returns null
/// when allocation fails.
pub fn alloc_utf8<P: Sqlite3Api>(api: &P, value: &str) -> *mut c_char {
    let bytes = value.as_bytes();
    let Some(ptr) = allocate(api, bytes.len() + 1) else {
        return core::ptr::null_mut();
    };
    let ptr = ptr.as_ptr() as *mut u8;
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        *ptr.add(bytes.len()) = 0;
    }
    ptr as *mut c_char
}

/// Decode the CREATE VIRTUAL TABLE argument vector.
///
/// # Safety
/// `argv` must be null or point to `argc` NUL-terminated strings.
pub unsafe fn parse_args(argc: i32, argv: *const *const u8) -> Vec<String> {
    let argc = if argc < 0 { 0 } else { argc as usize };
    let mut out = Vec::with_capacity(argc);
    if argc == 0 || argv.is_null() {
        return out;
    }
    let values = unsafe { core::slice::from_raw_parts(argv, argc) };
    for value in values {
        out.push(unsafe { utf8_from_native(*value, None) }.unwrap_or_default());
    }
    out
}

/// Native table struct handed to the engine: the engine-visible base
/// followed by the owning dispatch object.
#[repr(C)]
pub struct NativeTable {
    /// Engine-visible `sqlite3_vtab`.
    pub base: sqlite3_vtab,
    /// Dispatch object (module host) that created the table.
    pub host: *mut c_void,
}

/// Allocate a zeroed native table struct bound to `host`.
pub fn alloc_native_table<P: Sqlite3Api>(api: &P, host: *mut c_void) -> *mut NativeTable {
    let Some(ptr) = allocate_zeroed(api, core::mem::size_of::<NativeTable>()) else {
        return core::ptr::null_mut();
    };
    let table = ptr.as_ptr() as *mut NativeTable;
    unsafe { (*table).host = host };
    table
}

/// Free a native table struct together with any pending error message.
///
/// # Safety
/// `table` must be null or come from [`alloc_native_table`] with the same
/// provider, and must not be used afterwards.
pub unsafe fn free_native_table<P: Sqlite3Api>(api: &P, table: *mut sqlite3_vtab) {
    if table.is_null() {
        return;
    }
    unsafe {
        let message = (*table).z_err_msg;
        (*table).z_err_msg = core::ptr::null_mut();
        free(api, message as *mut c_void);
    }
    free(api, table as *mut c_void);
}

/// Allocate a zeroed native cursor struct pointing at `table`.
pub fn alloc_native_cursor<P: Sqlite3Api>(
    api: &P,
    table: *mut sqlite3_vtab,
) -> *mut sqlite3_vtab_cursor {
    let Some(ptr) = allocate_zeroed(api, core::mem::size_of::<sqlite3_vtab_cursor>()) else {
        return core::ptr::null_mut();
    };
    let cursor = ptr.as_ptr() as *mut sqlite3_vtab_cursor;
    unsafe { (*cursor).p_vtab = table };
    cursor
}

/// Free a native cursor struct.
pub fn free_native_cursor<P: Sqlite3Api>(api: &P, cursor: *mut sqlite3_vtab_cursor) {
    free(api, cursor as *mut c_void);
}

#[cfg(test)]
mod tests {
    use super::{
        next_offset_of, read_f64, read_i32, read_i64, read_ptr, read_u8, str_from_native,
        string_to_utf8z, utf8_from_native, write_f64, write_i32, write_i64, write_ptr, write_u8,
    };

    #[test]
    fn next_offset_rounds_to_alignment() {
        assert_eq!(next_offset_of(0, 4, 8), 8);
        assert_eq!(next_offset_of(8, 8, 4), 16);
        assert_eq!(next_offset_of(56, 4, 8), 64);
        assert_eq!(next_offset_of(4, 1, 1), 5);
        assert_eq!(next_offset_of(5, 1, 4), 8);
        assert_eq!(next_offset_of(12, 4, 0), 16);
    }

    #[test]
    fn scalar_access_at_unaligned_offsets() {
        let mut buf = [0u8; 64];
        let base = buf.as_mut_ptr() as *mut core::ffi::c_void;
        unsafe {
            write_i32(base, 1, -7);
            write_i64(base, 5, i64::MIN);
            write_f64(base, 13, 2.5);
            write_u8(base, 21, 0xab);
            write_ptr(base, 22, base);
            assert_eq!(read_i32(base, 1), -7);
            assert_eq!(read_i64(base, 5), i64::MIN);
            assert_eq!(read_f64(base, 13), 2.5);
            assert_eq!(read_u8(base, 21), 0xab);
            assert_eq!(read_ptr(base, 22), base);
        }
    }

    #[test]
    fn native_strings() {
        let bytes = string_to_utf8z("héllo");
        assert_eq!(bytes.last(), Some(&0));
        let text = unsafe { utf8_from_native(bytes.as_ptr(), None) };
        assert_eq!(text.as_deref(), Some("héllo"));
        let prefix = unsafe { str_from_native(bytes.as_ptr(), Some(1)) };
        assert_eq!(prefix, Some("h"));
        assert_eq!(unsafe { utf8_from_native(core::ptr::null(), None) }, None);
    }
}
