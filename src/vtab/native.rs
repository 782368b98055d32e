use core::ffi::c_void;
use core::panic::AssertUnwindSafe;

use crate::marshal::{self, NativeTable};
use crate::provider::{
    FindFunctionOut, Sqlite3Api, sqlite3_module, sqlite3_vtab, sqlite3_vtab_cursor,
};

const SQLITE_ERROR: i32 = 1;

/// Raw virtual table callbacks, one method per `sqlite3_module` slot.
///
/// Tables returned from `x_create`/`x_connect` must be allocated with
/// [`marshal::alloc_native_table`]: the registered callbacks find their
/// dispatch object through the `host` field of that struct.
///
/// # Safety
/// Every pointer argument comes straight from the engine; implementations
/// must follow the `sqlite3_module` contracts for them.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub trait NativeModule<P: Sqlite3Api> {
    unsafe fn x_create(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32;
    unsafe fn x_connect(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32;
    unsafe fn x_best_index(&mut self, vtab: *mut sqlite3_vtab, info: *mut c_void) -> i32;
    unsafe fn x_disconnect(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_destroy(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_open(
        &mut self,
        vtab: *mut sqlite3_vtab,
        out_cursor: *mut *mut sqlite3_vtab_cursor,
    ) -> i32;
    unsafe fn x_close(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32;
    unsafe fn x_filter(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        idx_num: i32,
        idx_str: *const u8,
        argc: i32,
        argv: *mut *mut P::Value,
    ) -> i32;
    unsafe fn x_next(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32;
    unsafe fn x_eof(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32;
    unsafe fn x_column(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        ctx: *mut P::Context,
        column: i32,
    ) -> i32;
    unsafe fn x_rowid(&mut self, cursor: *mut sqlite3_vtab_cursor, out_rowid: *mut i64) -> i32;
    unsafe fn x_update(
        &mut self,
        vtab: *mut sqlite3_vtab,
        argc: i32,
        argv: *mut *mut P::Value,
        out_rowid: *mut i64,
    ) -> i32;
    unsafe fn x_begin(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_sync(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_commit(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_rollback(&mut self, vtab: *mut sqlite3_vtab) -> i32;
    unsafe fn x_find_function(
        &mut self,
        vtab: *mut sqlite3_vtab,
        n_args: i32,
        name: *const u8,
        out_func: FindFunctionOut<P>,
        out_arg: *mut *mut c_void,
    ) -> i32;
    unsafe fn x_rename(&mut self, vtab: *mut sqlite3_vtab, new_name: *const u8) -> i32;
    unsafe fn x_savepoint(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32;
    unsafe fn x_release(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32;
    unsafe fn x_rollback_to(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32;
}

fn contain(f: impl FnOnce() -> i32) -> i32 {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(SQLITE_ERROR)
}

unsafe fn from_aux<'a, N>(aux: *mut c_void) -> Option<&'a mut N> {
    unsafe { (aux as *mut N).as_mut() }
}

unsafe fn from_vtab<'a, N>(vtab: *mut sqlite3_vtab) -> Option<&'a mut N> {
    if vtab.is_null() {
        return None;
    }
    unsafe { from_aux((*(vtab as *mut NativeTable)).host) }
}

unsafe fn from_cursor<'a, N>(cursor: *mut sqlite3_vtab_cursor) -> Option<&'a mut N> {
    if cursor.is_null() {
        return None;
    }
    unsafe { from_vtab((*cursor).p_vtab) }
}

extern "C" fn x_create<P: Sqlite3Api, N: NativeModule<P>>(
    db: *mut P::Db,
    aux: *mut c_void,
    argc: i32,
    argv: *const *const u8,
    out_vtab: *mut *mut sqlite3_vtab,
    out_err: *mut *mut u8,
) -> i32 {
    contain(|| {
        let Some(module) = (unsafe { from_aux::<N>(aux) }) else {
            return SQLITE_ERROR;
        };
        let rc = unsafe { module.x_create(db, argc, argv, out_vtab, out_err) };
        unsafe { bind_host(rc, aux, out_vtab) };
        rc
    })
}

extern "C" fn x_connect<P: Sqlite3Api, N: NativeModule<P>>(
    db: *mut P::Db,
    aux: *mut c_void,
    argc: i32,
    argv: *const *const u8,
    out_vtab: *mut *mut sqlite3_vtab,
    out_err: *mut *mut u8,
) -> i32 {
    contain(|| {
        let Some(module) = (unsafe { from_aux::<N>(aux) }) else {
            return SQLITE_ERROR;
        };
        let rc = unsafe { module.x_connect(db, argc, argv, out_vtab, out_err) };
        unsafe { bind_host(rc, aux, out_vtab) };
        rc
    })
}

unsafe fn bind_host(rc: i32, aux: *mut c_void, out_vtab: *mut *mut sqlite3_vtab) {
    if rc != 0 || out_vtab.is_null() {
        return;
    }
    let table = unsafe { *out_vtab } as *mut NativeTable;
    if !table.is_null() {
        unsafe { (*table).host = aux };
    }
}

macro_rules! table_trampoline {
    ($name:ident, $method:ident $(, $arg:ident : $ty:ty)*) => {
        extern "C" fn $name<P: Sqlite3Api, N: NativeModule<P>>(
            vtab: *mut sqlite3_vtab
            $(, $arg: $ty)*
        ) -> i32 {
            contain(|| match unsafe { from_vtab::<N>(vtab) } {
                Some(module) => unsafe { module.$method(vtab $(, $arg)*) },
                None => SQLITE_ERROR,
            })
        }
    };
}

macro_rules! cursor_trampoline {
    ($name:ident, $method:ident, $missing:expr $(, $arg:ident : $ty:ty)*) => {
        extern "C" fn $name<P: Sqlite3Api, N: NativeModule<P>>(
            cursor: *mut sqlite3_vtab_cursor
            $(, $arg: $ty)*
        ) -> i32 {
            contain(|| match unsafe { from_cursor::<N>(cursor) } {
                Some(module) => unsafe { module.$method(cursor $(, $arg)*) },
                None => $missing,
            })
        }
    };
}

table_trampoline!(x_best_index, x_best_index, info: *mut c_void);
table_trampoline!(x_disconnect, x_disconnect);
table_trampoline!(x_destroy, x_destroy);
table_trampoline!(x_open, x_open, out_cursor: *mut *mut sqlite3_vtab_cursor);
table_trampoline!(x_begin, x_begin);
table_trampoline!(x_sync, x_sync);
table_trampoline!(x_commit, x_commit);
table_trampoline!(x_rollback, x_rollback);
table_trampoline!(x_rename, x_rename, new_name: *const u8);
table_trampoline!(x_savepoint, x_savepoint, savepoint: i32);
table_trampoline!(x_release, x_release, savepoint: i32);
table_trampoline!(x_rollback_to, x_rollback_to, savepoint: i32);

cursor_trampoline!(x_close, x_close, SQLITE_ERROR);
cursor_trampoline!(x_next, x_next, SQLITE_ERROR);
cursor_trampoline!(x_eof, x_eof, 1);
cursor_trampoline!(x_rowid, x_rowid, SQLITE_ERROR, out_rowid: *mut i64);

extern "C" fn x_filter<P: Sqlite3Api, N: NativeModule<P>>(
    cursor: *mut sqlite3_vtab_cursor,
    idx_num: i32,
    idx_str: *const u8,
    argc: i32,
    argv: *mut *mut P::Value,
) -> i32 {
    contain(|| match unsafe { from_cursor::<N>(cursor) } {
        Some(module) => unsafe { module.x_filter(cursor, idx_num, idx_str, argc, argv) },
        None => SQLITE_ERROR,
    })
}

extern "C" fn x_column<P: Sqlite3Api, N: NativeModule<P>>(
    cursor: *mut sqlite3_vtab_cursor,
    ctx: *mut P::Context,
    column: i32,
) -> i32 {
    contain(|| match unsafe { from_cursor::<N>(cursor) } {
        Some(module) => unsafe { module.x_column(cursor, ctx, column) },
        None => SQLITE_ERROR,
    })
}

extern "C" fn x_update<P: Sqlite3Api, N: NativeModule<P>>(
    vtab: *mut sqlite3_vtab,
    argc: i32,
    argv: *mut *mut P::Value,
    out_rowid: *mut i64,
) -> i32 {
    contain(|| match unsafe { from_vtab::<N>(vtab) } {
        Some(module) => unsafe { module.x_update(vtab, argc, argv, out_rowid) },
        None => SQLITE_ERROR,
    })
}

extern "C" fn x_find_function<P: Sqlite3Api, N: NativeModule<P>>(
    vtab: *mut sqlite3_vtab,
    n_args: i32,
    name: *const u8,
    out_func: FindFunctionOut<P>,
    out_arg: *mut *mut c_void,
) -> i32 {
    let found = std::panic::catch_unwind(AssertUnwindSafe(|| {
        match unsafe { from_vtab::<N>(vtab) } {
            Some(module) => unsafe { module.x_find_function(vtab, n_args, name, out_func, out_arg) },
            None => 0,
        }
    }));
    found.unwrap_or(0)
}

/// Highest `iVersion` whose slots [`sqlite3_module`] lays out.
pub const MAX_MODULE_VERSION: i32 = 2;

/// Build a `sqlite3_module` whose callbacks dispatch to `N`.
///
/// `version` is clamped to `1..=MAX_MODULE_VERSION`; below 2 the savepoint
/// slots stay empty.
pub fn native_module_table<P, N>(version: i32) -> sqlite3_module<P>
where
    P: Sqlite3Api,
    N: NativeModule<P>,
{
    let version = version.clamp(1, MAX_MODULE_VERSION);
    let savepoints = version >= 2;
    sqlite3_module {
        i_version: version,
        x_create: Some(x_create::<P, N>),
        x_connect: Some(x_connect::<P, N>),
        x_best_index: Some(x_best_index::<P, N>),
        x_disconnect: Some(x_disconnect::<P, N>),
        x_destroy: Some(x_destroy::<P, N>),
        x_open: Some(x_open::<P, N>),
        x_close: Some(x_close::<P, N>),
        x_filter: Some(x_filter::<P, N>),
        x_next: Some(x_next::<P, N>),
        x_eof: Some(x_eof::<P, N>),
        x_column: Some(x_column::<P, N>),
        x_rowid: Some(x_rowid::<P, N>),
        x_update: Some(x_update::<P, N>),
        x_begin: Some(x_begin::<P, N>),
        x_sync: Some(x_sync::<P, N>),
        x_commit: Some(x_commit::<P, N>),
        x_rollback: Some(x_rollback::<P, N>),
        x_find_function: Some(x_find_function::<P, N>),
        x_rename: Some(x_rename::<P, N>),
        x_savepoint: if savepoints {
            Some(x_savepoint::<P, N>)
        } else {
            None
        },
        x_release: if savepoints {
            Some(x_release::<P, N>)
        } else {
            None
        },
        x_rollback_to: if savepoints {
            Some(x_rollback_to::<P, N>)
        } else {
            None
        },
    }
}

const UNAVAILABLE: &str = "native module implementation not available";

/// [`NativeModule`] that forwards every callback to a pluggable
/// implementation, failing each one when none is installed.
pub struct ForwardingModule<P: Sqlite3Api> {
    api: *const P,
    inner: Option<Box<dyn NativeModule<P>>>,
}

impl<P: Sqlite3Api> ForwardingModule<P> {
    pub fn new(api: &P, inner: Option<Box<dyn NativeModule<P>>>) -> Self {
        Self {
            api: api as *const P,
            inner,
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }

    /// Install or remove the implementation.
    pub fn set_inner(&mut self, inner: Option<Box<dyn NativeModule<P>>>) {
        self.inner = inner;
    }

    fn api(&self) -> &P {
        unsafe { &*self.api }
    }

    unsafe fn unavailable(&self, vtab: *mut sqlite3_vtab) -> i32 {
        if !vtab.is_null() {
            unsafe {
                marshal::free(self.api(), (*vtab).z_err_msg as *mut c_void);
                (*vtab).z_err_msg = marshal::alloc_utf8(self.api(), UNAVAILABLE);
            }
        }
        tracing::warn!("{}", UNAVAILABLE);
        SQLITE_ERROR
    }

    unsafe fn unavailable_cursor(&self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        if cursor.is_null() {
            return SQLITE_ERROR;
        }
        unsafe { self.unavailable((*cursor).p_vtab) }
    }

    unsafe fn unavailable_create(&self, out_err: *mut *mut u8) -> i32 {
        if !out_err.is_null() {
            unsafe { *out_err = marshal::alloc_utf8(self.api(), UNAVAILABLE) as *mut u8 };
        }
        tracing::warn!("{}", UNAVAILABLE);
        SQLITE_ERROR
    }
}

impl<P: Sqlite3Api> NativeModule<P> for ForwardingModule<P> {
    unsafe fn x_create(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_create(db, argc, argv, out_vtab, out_err) },
            None => unsafe { self.unavailable_create(out_err) },
        }
    }

    unsafe fn x_connect(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_connect(db, argc, argv, out_vtab, out_err) },
            None => unsafe { self.unavailable_create(out_err) },
        }
    }

    unsafe fn x_best_index(&mut self, vtab: *mut sqlite3_vtab, info: *mut c_void) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_best_index(vtab, info) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_disconnect(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_disconnect(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_destroy(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_destroy(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_open(
        &mut self,
        vtab: *mut sqlite3_vtab,
        out_cursor: *mut *mut sqlite3_vtab_cursor,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_open(vtab, out_cursor) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_close(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_close(cursor) },
            None => unsafe { self.unavailable_cursor(cursor) },
        }
    }

    unsafe fn x_filter(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        idx_num: i32,
        idx_str: *const u8,
        argc: i32,
        argv: *mut *mut P::Value,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_filter(cursor, idx_num, idx_str, argc, argv) },
            None => unsafe { self.unavailable_cursor(cursor) },
        }
    }

    unsafe fn x_next(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_next(cursor) },
            None => unsafe { self.unavailable_cursor(cursor) },
        }
    }

    unsafe fn x_eof(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_eof(cursor) },
            None => {
                unsafe { self.unavailable_cursor(cursor) };
                1
            }
        }
    }

    unsafe fn x_column(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        ctx: *mut P::Context,
        column: i32,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_column(cursor, ctx, column) },
            None => unsafe { self.unavailable_cursor(cursor) },
        }
    }

    unsafe fn x_rowid(&mut self, cursor: *mut sqlite3_vtab_cursor, out_rowid: *mut i64) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_rowid(cursor, out_rowid) },
            None => unsafe { self.unavailable_cursor(cursor) },
        }
    }

    unsafe fn x_update(
        &mut self,
        vtab: *mut sqlite3_vtab,
        argc: i32,
        argv: *mut *mut P::Value,
        out_rowid: *mut i64,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_update(vtab, argc, argv, out_rowid) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_begin(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_begin(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_sync(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_sync(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_commit(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_commit(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_rollback(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_rollback(vtab) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_find_function(
        &mut self,
        vtab: *mut sqlite3_vtab,
        n_args: i32,
        name: *const u8,
        out_func: FindFunctionOut<P>,
        out_arg: *mut *mut c_void,
    ) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_find_function(vtab, n_args, name, out_func, out_arg) },
            None => 0,
        }
    }

    unsafe fn x_rename(&mut self, vtab: *mut sqlite3_vtab, new_name: *const u8) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_rename(vtab, new_name) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_savepoint(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_savepoint(vtab, savepoint) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_release(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_release(vtab, savepoint) },
            None => unsafe { self.unavailable(vtab) },
        }
    }

    unsafe fn x_rollback_to(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        match self.inner.as_mut() {
            Some(inner) => unsafe { inner.x_rollback_to(vtab, savepoint) },
            None => unsafe { self.unavailable(vtab) },
        }
    }
}
