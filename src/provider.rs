use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, ErrorCode, Result};

/// SQLite API version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    /// Major version component (X in X.Y.Z).
    pub major: u16,
    /// Minor version component (Y in X.Y.Z).
    pub minor: u16,
    /// Patch version component (Z in X.Y.Z).
    pub patch: u16,
}

impl ApiVersion {
    /// Build an API version from major/minor/patch components.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode `sqlite3_libversion_number()` form (`X*1000000 + Y*1000 + Z`).
    pub const fn from_number(number: i32) -> Self {
        let number = if number < 0 { 0 } else { number };
        Self {
            major: (number / 1_000_000) as u16,
            minor: ((number / 1_000) % 1_000) as u16,
            patch: (number % 1_000) as u16,
        }
    }
}

/// Backend feature flags exposed by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureSet {
    bits: u64,
}

impl FeatureSet {
    /// `create_function_v2` is available.
    pub const CREATE_FUNCTION_V2: FeatureSet = FeatureSet { bits: 1 << 1 };
    /// Virtual table APIs are available.
    pub const VIRTUAL_TABLES: FeatureSet = FeatureSet { bits: 1 << 2 };
    /// `sqlite3_overload_function` is available.
    pub const OVERLOAD_FUNCTION: FeatureSet = FeatureSet { bits: 1 << 6 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Build a flag set from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> u64 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: FeatureSet) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: FeatureSet) -> FeatureSet {
        FeatureSet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl core::ops::BitOrAssign for FeatureSet {
    fn bitor_assign(&mut self, rhs: FeatureSet) {
        self.bits |= rhs.bits;
    }
}

/// Flags for opening a database connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    bits: u32,
}

impl OpenFlags {
    /// Open database in read-only mode.
    pub const READ_ONLY: OpenFlags = OpenFlags { bits: 1 << 0 };
    /// Open database in read-write mode.
    pub const READ_WRITE: OpenFlags = OpenFlags { bits: 1 << 1 };
    /// Create database file when missing.
    pub const CREATE: OpenFlags = OpenFlags { bits: 1 << 2 };
    /// Treat filename as URI when supported.
    pub const URI: OpenFlags = OpenFlags { bits: 1 << 3 };
    /// Use connection-private mutex mode.
    pub const NO_MUTEX: OpenFlags = OpenFlags { bits: 1 << 4 };
    /// Use fully serialized mutex mode.
    pub const FULL_MUTEX: OpenFlags = OpenFlags { bits: 1 << 5 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> u32 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: OpenFlags) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Options passed to `Sqlite3Api::open`.
pub struct OpenOptions<'a> {
    /// Backend-open flags translated from caller intent.
    pub flags: OpenFlags,
    /// Optional VFS name passed through to backend open.
    pub vfs: Option<&'a str>,
}

/// SQLite storage class ("type affinity") of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer,
    /// 64-bit floating value.
    Float,
    /// UTF-8 text.
    Text,
    /// Binary blob.
    Blob,
    /// Storage-class code this crate does not recognize.
    Unknown(i32),
}

impl ValueType {
    /// Decode SQLite's integer storage-class code.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            5 => ValueType::Null,
            other => ValueType::Unknown(other),
        }
    }

    /// Encode this storage class into SQLite's integer code.
    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Null => 5,
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
            ValueType::Unknown(code) => code,
        }
    }
}

/// Raw view into SQLite-managed bytes.
///
/// The pointer/length are tied to the lifetime of the current SQLite
/// value snapshot and become invalid once the callback that produced them
/// returns. Callers that need longer-lived data must copy the bytes.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    /// Pointer to backend-owned bytes.
    pub ptr: *const u8,
    /// Byte length of `ptr`.
    pub len: usize,
}

impl RawBytes {
    /// Empty byte view.
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for the returned slice.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// Caller must ensure the bytes remain valid for `'a`.
    pub unsafe fn as_str<'a>(self) -> Option<&'a str> {
        core::str::from_utf8(unsafe { self.as_slice() }).ok()
    }
}

/// Function flags passed to `create_function_v2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionFlags {
    bits: u32,
}

impl FunctionFlags {
    /// Mark UDF as deterministic.
    pub const DETERMINISTIC: FunctionFlags = FunctionFlags { bits: 1 << 0 };
    /// Restrict UDF to direct SQL only.
    pub const DIRECT_ONLY: FunctionFlags = FunctionFlags { bits: 1 << 1 };
    /// Mark UDF as innocuous.
    pub const INNOCUOUS: FunctionFlags = FunctionFlags { bits: 1 << 2 };

    /// Build an empty flag set.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Return the raw bit representation.
    pub const fn bits(self) -> u32 {
        self.bits
    }

    /// Return whether `other` is fully contained in this set.
    pub const fn contains(self, other: FunctionFlags) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl core::ops::BitOr for FunctionFlags {
    type Output = FunctionFlags;

    fn bitor(self, rhs: FunctionFlags) -> FunctionFlags {
        FunctionFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

/// Scalar callback signature shared by `create_function_v2` and `xFindFunction`.
pub type ScalarCallback<P> =
    extern "C" fn(*mut <P as Sqlite3Api>::Context, i32, *mut *mut <P as Sqlite3Api>::Value);

/// Provider SPI over a SQLite C API backend.
///
/// # Safety
/// Implementations must uphold the SQLite C ABI contracts.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    /// Backend's opaque `sqlite3*` type.
    type Db;
    /// Backend's opaque `sqlite3_value*` type.
    type Value;
    /// Backend's opaque `sqlite3_context*` type.
    type Context;

    /// Declared SQLite API version supported by this provider implementation.
    fn api_version(&self) -> ApiVersion;
    /// Compile/runtime capability flags available through this provider.
    fn feature_set(&self) -> FeatureSet;
    /// Stable backend identifier (for diagnostics and capability routing).
    fn backend_name(&self) -> &'static str;
    /// Optional backend runtime version (if queryable).
    fn backend_version(&self) -> Option<ApiVersion>;
    /// Version used for struct-layout capability checks: the runtime library
    /// version when known, otherwise the declared API version.
    fn library_version(&self) -> ApiVersion {
        self.backend_version().unwrap_or_else(|| self.api_version())
    }
    /// Return SQLite allocator-compatible memory for cross-FFI ownership.
    ///
    /// Returned pointers must be releasable via `free` below and must match
    /// SQLite allocator expectations for this backend. Returns null on
    /// allocation failure.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    /// Free memory allocated through `malloc`. Null is ignored.
    unsafe fn free(&self, ptr: *mut c_void);

    /// Open a database connection using backend-specific `open_v2` semantics.
    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>>;
    /// Close a database connection handle.
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;

    /// Register scalar callbacks.
    ///
    /// # Ownership contract
    /// Ownership of `user_data` and `drop_user_data` is transferred to the
    /// provider at call entry.
    ///
    /// If registration succeeds, the provider must eventually invoke
    /// `drop_user_data` exactly once when the function definition is replaced,
    /// removed, or the owning connection is closed.
    ///
    /// If registration fails and this method returns `Err`, the provider must
    /// invoke `drop_user_data` exactly once before returning.
    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        x_func: Option<ScalarCallback<Self>>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()>
    where
        Self: Sized;

    /// Make `name/n_args` resolvable so virtual tables may overload it
    /// (`sqlite3_overload_function`).
    unsafe fn overload_function(&self, _db: NonNull<Self::Db>, _name: &str, _n_args: i32) -> Result<()> {
        Err(Error::feature_unavailable("overload_function unsupported"))
    }

    /// Set current function result to NULL.
    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    /// Set current function result to a 32-bit integer.
    unsafe fn result_int(&self, ctx: NonNull<Self::Context>, v: i32) {
        unsafe { self.result_int64(ctx, i64::from(v)) }
    }
    /// Set current function result to integer.
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    /// Set current function result to floating value.
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// Providers must ensure SQLite copies or retains the buffer for `v`.
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str);
    /// Providers must ensure SQLite copies or retains the buffer for `v`.
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Set current function result to a blob of `n` zero bytes.
    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, n: i32);
    /// Set current function result to an error message.
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str);
    /// Override the error code of the current function result.
    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32);
    /// Report `SQLITE_TOOBIG` for the current function result.
    unsafe fn result_error_toobig(&self, ctx: NonNull<Self::Context>) {
        unsafe { self.result_error_code(ctx, ErrorCode::TooBig.code().unwrap_or(18)) }
    }
    /// Report `SQLITE_NOMEM` for the current function result.
    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        unsafe { self.result_error_code(ctx, ErrorCode::NoMem.code().unwrap_or(7)) }
    }
    /// Copy another value into the current function result.
    unsafe fn result_value(&self, ctx: NonNull<Self::Context>, v: NonNull<Self::Value>);
    /// Return function `user_data` for `ctx`.
    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void;

    /// SQLite storage class of a value.
    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    /// 32-bit integer view of a value.
    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32 {
        unsafe { self.value_int64(v) as i32 }
    }
    /// Integer view of a value.
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    /// Floating view of a value.
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    /// Raw text bytes view of a value.
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Raw blob bytes view of a value.
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;
    /// Size in bytes of the value's text or blob representation.
    unsafe fn value_bytes(&self, v: NonNull<Self::Value>) -> i32;

    /// Declare a virtual table schema during xCreate/xConnect.
    unsafe fn declare_vtab(&self, db: NonNull<Self::Db>, schema: &str) -> Result<()>;

    /// Register a virtual table module.
    ///
    /// Follows the same ownership contract as `create_function_v2` for
    /// `user_data` / `drop_user_data`.
    unsafe fn create_module_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        module: &'static sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()>
    where
        Self: Sized;
}

/// Base of every native virtual table instance (`sqlite3_vtab`).
#[repr(C)]
pub struct sqlite3_vtab {
    /// Module that created the table; owned by the engine.
    pub p_module: *const c_void,
    /// Engine reference count.
    pub n_ref: i32,
    /// Error message slot, allocated with the engine allocator.
    pub z_err_msg: *mut c_char,
}

/// Base of every native virtual table cursor (`sqlite3_vtab_cursor`).
#[repr(C)]
pub struct sqlite3_vtab_cursor {
    /// Owning table.
    pub p_vtab: *mut sqlite3_vtab,
}

/// `xFindFunction` output slot for the overloading callback.
pub type FindFunctionOut<P> = *mut Option<ScalarCallback<P>>;

/// Typed wrapper for `sqlite3_module` (fields through `iVersion = 2`).
#[repr(C)]
pub struct sqlite3_module<P: Sqlite3Api> {
    /// Module ABI version.
    pub i_version: i32,
    /// `xCreate` callback for `CREATE VIRTUAL TABLE`.
    pub x_create: Option<
        extern "C" fn(
            *mut P::Db,
            *mut c_void,
            i32,
            *const *const u8,
            *mut *mut sqlite3_vtab,
            *mut *mut u8,
        ) -> i32,
    >,
    /// `xConnect` callback for `CONNECT`ing to an existing virtual table.
    pub x_connect: Option<
        extern "C" fn(
            *mut P::Db,
            *mut c_void,
            i32,
            *const *const u8,
            *mut *mut sqlite3_vtab,
            *mut *mut u8,
        ) -> i32,
    >,
    /// `xBestIndex` query-planning callback.
    pub x_best_index: Option<extern "C" fn(*mut sqlite3_vtab, *mut c_void) -> i32>,
    /// `xDisconnect` callback for disconnecting a table instance.
    pub x_disconnect: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xDestroy` callback for dropping a virtual table.
    pub x_destroy: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xOpen` callback for creating a cursor.
    pub x_open: Option<extern "C" fn(*mut sqlite3_vtab, *mut *mut sqlite3_vtab_cursor) -> i32>,
    /// `xClose` callback for closing a cursor.
    pub x_close: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    /// `xFilter` callback for starting a cursor scan.
    pub x_filter: Option<
        extern "C" fn(*mut sqlite3_vtab_cursor, i32, *const u8, i32, *mut *mut P::Value) -> i32,
    >,
    /// `xNext` callback for advancing a cursor.
    pub x_next: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    /// `xEof` callback for cursor end-of-scan checks.
    pub x_eof: Option<extern "C" fn(*mut sqlite3_vtab_cursor) -> i32>,
    /// `xColumn` callback for reading the current row value.
    pub x_column: Option<extern "C" fn(*mut sqlite3_vtab_cursor, *mut P::Context, i32) -> i32>,
    /// `xRowid` callback for reading the current rowid.
    pub x_rowid: Option<extern "C" fn(*mut sqlite3_vtab_cursor, *mut i64) -> i32>,
    /// `xUpdate` callback for INSERT/UPDATE/DELETE.
    pub x_update:
        Option<extern "C" fn(*mut sqlite3_vtab, i32, *mut *mut P::Value, *mut i64) -> i32>,
    /// `xBegin` transaction hook.
    pub x_begin: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xSync` transaction hook.
    pub x_sync: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xCommit` transaction hook.
    pub x_commit: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xRollback` transaction hook.
    pub x_rollback: Option<extern "C" fn(*mut sqlite3_vtab) -> i32>,
    /// `xFindFunction` overload lookup.
    pub x_find_function: Option<
        extern "C" fn(*mut sqlite3_vtab, i32, *const u8, FindFunctionOut<P>, *mut *mut c_void) -> i32,
    >,
    /// `xRename` callback for `ALTER TABLE ... RENAME TO`.
    pub x_rename: Option<extern "C" fn(*mut sqlite3_vtab, *const u8) -> i32>,
    /// `xSavepoint` hook (`iVersion >= 2`).
    pub x_savepoint: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
    /// `xRelease` hook (`iVersion >= 2`).
    pub x_release: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
    /// `xRollbackTo` hook (`iVersion >= 2`).
    pub x_rollback_to: Option<extern "C" fn(*mut sqlite3_vtab, i32) -> i32>,
}
