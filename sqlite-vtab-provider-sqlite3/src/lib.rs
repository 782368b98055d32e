//! Dynamic `libsqlite3` backend adapter for `sqlite-vtab-provider`.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_vtab_provider::{
    ApiVersion, Error, ErrorCode, FeatureSet, FunctionFlags, OpenFlags, OpenOptions, RawBytes,
    Result, Sqlite3Api, ValueType,
};
use std::ffi::{CStr, CString};
use std::ptr::{NonNull, null, null_mut};
use std::sync::OnceLock;

mod core_impl;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
extern "C" {}

const SQLITE_OK: i32 = 0;
const SQLITE_ABORT: i32 = 4;

const SQLITE_OPEN_READONLY: i32 = 0x0000_0001;
const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
const SQLITE_OPEN_URI: i32 = 0x0000_0040;
const SQLITE_OPEN_NOMUTEX: i32 = 0x0000_8000;
const SQLITE_OPEN_FULLMUTEX: i32 = 0x0001_0000;

const SQLITE_UTF8: i32 = 0x0000_0001;
const SQLITE_DETERMINISTIC: i32 = 0x0000_0800;
const SQLITE_INNOCUOUS: i32 = 0x0002_0000;
const SQLITE_DIRECTONLY: i32 = 0x0008_0000;
const EMPTY_BYTE: u8 = 0;

type sqlite3 = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;

type sqlite3_destructor_type = Option<unsafe extern "C" fn(*mut c_void)>;
type sqlite3_callback =
    Option<extern "C" fn(*mut c_void, c_int, *mut *mut c_char, *mut *mut c_char) -> c_int>;

type OpenV2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type Close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type Exec = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    sqlite3_callback,
    *mut c_void,
    *mut *mut c_char,
) -> c_int;

type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type ExtendedErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;

type CreateFunctionV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context)>,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;
type OverloadFunction = unsafe extern "C" fn(*mut sqlite3, *const c_char, c_int) -> c_int;

type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultText =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int, sqlite3_destructor_type);
type ResultBlob =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultZeroblob = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type ResultErrorCode = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultErrorFlag = unsafe extern "C" fn(*mut sqlite3_context);
type ResultValue = unsafe extern "C" fn(*mut sqlite3_context, *mut sqlite3_value);
type UserData = unsafe extern "C" fn(*mut sqlite3_context) -> *mut c_void;

type ValueTypeFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueIntFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64Fn = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDoubleFn = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValueTextFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
type ValueBlobFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValueBytesFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;

type DeclareVTab = unsafe extern "C" fn(*mut sqlite3, *const c_char) -> c_int;
type CreateModuleV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *const c_void,
    *mut c_void,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;

type LibversionNumber = unsafe extern "C" fn() -> c_int;

type Malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
type Free = unsafe extern "C" fn(*mut c_void);

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    unsafe fn open() -> Option<Self> {
        let mut handle = null_mut();
        for name in lib_names() {
            let cstr = unsafe { CStr::from_bytes_with_nul_unchecked(name) };
            handle = unsafe { libc::dlopen(cstr.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                break;
            }
        }
        if handle.is_null() {
            None
        } else {
            Some(Self { handle })
        }
    }

    unsafe fn symbol<T>(&self, name: &'static [u8]) -> Option<T>
    where
        T: Copy,
    {
        let sym = unsafe { libc::dlsym(self.handle, name.as_ptr() as *const c_char) };
        if sym.is_null() {
            tracing::trace!(
                symbol = %String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]),
                "libsqlite3 symbol missing"
            );
            None
        } else {
            debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
            Some(unsafe { std::mem::transmute_copy(&sym) })
        }
    }
}

struct LibSqlite3Fns {
    open_v2: OpenV2,
    close: Close,
    exec: Exec,
    errmsg: ErrMsg,
    extended_errcode: Option<ExtendedErrCode>,
    create_function_v2: CreateFunctionV2,
    overload_function: Option<OverloadFunction>,
    result_null: ResultNull,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultText,
    result_blob: ResultBlob,
    result_zeroblob: ResultZeroblob,
    result_error: ResultError,
    result_error_code: ResultErrorCode,
    result_error_toobig: ResultErrorFlag,
    result_error_nomem: ResultErrorFlag,
    result_value: ResultValue,
    user_data: UserData,
    value_type: ValueTypeFn,
    value_int: ValueIntFn,
    value_int64: ValueInt64Fn,
    value_double: ValueDoubleFn,
    value_text: ValueTextFn,
    value_blob: ValueBlobFn,
    value_bytes: ValueBytesFn,
    declare_vtab: DeclareVTab,
    create_module_v2: Option<CreateModuleV2>,
    libversion_number: LibversionNumber,
    malloc: Malloc,
    free: Free,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> Option<Self> {
        unsafe {
            Some(Self {
                open_v2: lib.symbol(b"sqlite3_open_v2\0")?,
                close: lib.symbol(b"sqlite3_close\0")?,
                exec: lib.symbol(b"sqlite3_exec\0")?,
                errmsg: lib.symbol(b"sqlite3_errmsg\0")?,
                extended_errcode: lib.symbol(b"sqlite3_extended_errcode\0"),
                create_function_v2: lib.symbol(b"sqlite3_create_function_v2\0")?,
                overload_function: lib.symbol(b"sqlite3_overload_function\0"),
                result_null: lib.symbol(b"sqlite3_result_null\0")?,
                result_int64: lib.symbol(b"sqlite3_result_int64\0")?,
                result_double: lib.symbol(b"sqlite3_result_double\0")?,
                result_text: lib.symbol(b"sqlite3_result_text\0")?,
                result_blob: lib.symbol(b"sqlite3_result_blob\0")?,
                result_zeroblob: lib.symbol(b"sqlite3_result_zeroblob\0")?,
                result_error: lib.symbol(b"sqlite3_result_error\0")?,
                result_error_code: lib.symbol(b"sqlite3_result_error_code\0")?,
                result_error_toobig: lib.symbol(b"sqlite3_result_error_toobig\0")?,
                result_error_nomem: lib.symbol(b"sqlite3_result_error_nomem\0")?,
                result_value: lib.symbol(b"sqlite3_result_value\0")?,
                user_data: lib.symbol(b"sqlite3_user_data\0")?,
                value_type: lib.symbol(b"sqlite3_value_type\0")?,
                value_int: lib.symbol(b"sqlite3_value_int\0")?,
                value_int64: lib.symbol(b"sqlite3_value_int64\0")?,
                value_double: lib.symbol(b"sqlite3_value_double\0")?,
                value_text: lib.symbol(b"sqlite3_value_text\0")?,
                value_blob: lib.symbol(b"sqlite3_value_blob\0")?,
                value_bytes: lib.symbol(b"sqlite3_value_bytes\0")?,
                declare_vtab: lib.symbol(b"sqlite3_declare_vtab\0")?,
                create_module_v2: lib.symbol(b"sqlite3_create_module_v2\0"),
                libversion_number: lib.symbol(b"sqlite3_libversion_number\0")?,
                malloc: lib.symbol(b"sqlite3_malloc\0")?,
                free: lib.symbol(b"sqlite3_free\0")?,
            })
        }
    }
}

static USER_DATA_FN: OnceLock<UserData> = OnceLock::new();

/// Rows collected by [`LibSqlite3::query`]; `None` is SQL NULL.
pub type Rows = Vec<Vec<Option<String>>>;

/// Dynamic `libsqlite3` backend adapter loaded via `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    api_version: ApiVersion,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` and return a process-wide adapter instance.
    ///
    /// Returns `None` if the library or required symbols are unavailable.
    pub fn load() -> Option<&'static LibSqlite3> {
        static INSTANCE: OnceLock<Option<&'static LibSqlite3>> = OnceLock::new();
        *INSTANCE.get_or_init(|| unsafe { Self::load_uncached() })
    }

    unsafe fn load_uncached() -> Option<&'static LibSqlite3> {
        let Some(lib) = (unsafe { LibHandle::open() }) else {
            tracing::debug!("libsqlite3 not found");
            return None;
        };
        let fns = unsafe { LibSqlite3Fns::load(&lib) }?;
        let version_number = unsafe { (fns.libversion_number)() };
        let api_version = ApiVersion::from_number(version_number);
        let mut features = FeatureSet::CREATE_FUNCTION_V2;
        if fns.create_module_v2.is_some() {
            features |= FeatureSet::VIRTUAL_TABLES;
        }
        if fns.overload_function.is_some() {
            features |= FeatureSet::OVERLOAD_FUNCTION;
        }
        let _ = USER_DATA_FN.set(fns.user_data);
        tracing::debug!(version = version_number, features = features.bits(), "libsqlite3 loaded");
        let adapter = LibSqlite3 {
            fns,
            features,
            api_version,
            _lib: lib,
        };
        Some(Box::leak(Box::new(adapter)))
    }

    /// Run one or more statements, discarding any rows.
    ///
    /// # Safety
    /// `db` must be an open connection created by this adapter.
    pub unsafe fn exec(&self, db: NonNull<sqlite3>, sql: &str) -> Result<()> {
        unsafe { self.exec_with(db, sql, None, null_mut()) }
    }

    /// Run `sql` and collect every result row as text.
    ///
    /// # Safety
    /// `db` must be an open connection created by this adapter.
    pub unsafe fn query(&self, db: NonNull<sqlite3>, sql: &str) -> Result<Rows> {
        let mut rows: Rows = Vec::new();
        unsafe {
            self.exec_with(
                db,
                sql,
                Some(collect_row),
                &mut rows as *mut Rows as *mut c_void,
            )?
        };
        Ok(rows)
    }

    unsafe fn exec_with(
        &self,
        db: NonNull<sqlite3>,
        sql: &str,
        callback: sqlite3_callback,
        arg: *mut c_void,
    ) -> Result<()> {
        let sql = CString::new(sql)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "sql contains NUL"))?;
        let mut errmsg: *mut c_char = null_mut();
        let rc = unsafe { (self.fns.exec)(db.as_ptr(), sql.as_ptr(), callback, arg, &mut errmsg) };
        if rc == SQLITE_OK {
            return Ok(());
        }
        let message = unsafe { raw_cstr(errmsg) }.map(|c| c.to_string_lossy().into_owned());
        unsafe { (self.fns.free)(errmsg as *mut c_void) };
        let extended = self
            .fns
            .extended_errcode
            .map(|f| unsafe { f(db.as_ptr()) });
        Err(Error::from_code(rc, message, extended))
    }

    fn error_from_rc(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended =
            db.and_then(|db| self.fns.extended_errcode.map(|f| unsafe { f(db.as_ptr()) }));
        Error::from_code(rc, message, extended)
    }

    // Allocate with sqlite3_malloc so SQLite can free via sqlite3_free.
    fn alloc_copy(&self, bytes: &[u8]) -> Result<(*const c_void, sqlite3_destructor_type)> {
        if bytes.is_empty() {
            return Ok((&EMPTY_BYTE as *const u8 as *const c_void, None));
        }
        if bytes.len() > i32::MAX as usize {
            return Err(Error::with_message(ErrorCode::TooBig, "value too large"));
        }
        let ptr = unsafe { (self.fns.malloc)(bytes.len() as i32) };
        if ptr.is_null() {
            return Err(Error::new(ErrorCode::NoMem));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        Ok((ptr, Some(self.fns.free)))
    }
}

extern "C" fn collect_row(
    arg: *mut c_void,
    n_cols: c_int,
    values: *mut *mut c_char,
    _names: *mut *mut c_char,
) -> c_int {
    let Some(rows) = (unsafe { (arg as *mut Rows).as_mut() }) else {
        return SQLITE_ABORT;
    };
    let n_cols = usize::try_from(n_cols).unwrap_or(0);
    let mut row = Vec::with_capacity(n_cols);
    if !values.is_null() {
        let values = unsafe { std::slice::from_raw_parts(values, n_cols) };
        for value in values {
            row.push(unsafe { raw_cstr(*value) }.map(|c| c.to_string_lossy().into_owned()));
        }
    }
    rows.push(row);
    SQLITE_OK
}

fn map_open_flags(flags: OpenFlags) -> i32 {
    let mut out = 0;
    if flags.contains(OpenFlags::READ_ONLY) {
        out |= SQLITE_OPEN_READONLY;
    }
    if flags.contains(OpenFlags::READ_WRITE) {
        out |= SQLITE_OPEN_READWRITE;
    }
    if flags.contains(OpenFlags::CREATE) {
        out |= SQLITE_OPEN_CREATE;
    }
    if flags.contains(OpenFlags::URI) {
        out |= SQLITE_OPEN_URI;
    }
    if flags.contains(OpenFlags::NO_MUTEX) {
        out |= SQLITE_OPEN_NOMUTEX;
    }
    if flags.contains(OpenFlags::FULL_MUTEX) {
        out |= SQLITE_OPEN_FULLMUTEX;
    }
    out
}

fn map_function_flags(flags: FunctionFlags) -> i32 {
    let mut out = SQLITE_UTF8;
    if flags.contains(FunctionFlags::DETERMINISTIC) {
        out |= SQLITE_DETERMINISTIC;
    }
    if flags.contains(FunctionFlags::DIRECT_ONLY) {
        out |= SQLITE_DIRECTONLY;
    }
    if flags.contains(FunctionFlags::INNOCUOUS) {
        out |= SQLITE_INNOCUOUS;
    }
    out
}

fn clamp_len(len: usize) -> i32 {
    if len > i32::MAX as usize {
        i32::MAX
    } else {
        len as i32
    }
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

fn raw_bytes(ptr: *const u8, len: c_int) -> RawBytes {
    if ptr.is_null() {
        return RawBytes::empty();
    }
    RawBytes {
        ptr,
        len: usize::try_from(len).unwrap_or(0),
    }
}

fn lib_names() -> &'static [&'static [u8]] {
    #[cfg(target_os = "macos")]
    const NAMES: [&[u8]; 3] = [
        b"libsqlite3.dylib\0",
        b"libsqlite3.so.0\0",
        b"libsqlite3.so\0",
    ];
    #[cfg(not(target_os = "macos"))]
    const NAMES: [&[u8]; 2] = [b"libsqlite3.so.0\0", b"libsqlite3.so\0"];
    &NAMES
}
