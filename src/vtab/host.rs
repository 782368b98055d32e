use core::ffi::c_void;
use core::panic::AssertUnwindSafe;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::error::{Error, Result};
use crate::function::{Context, ScalarState, VTabFunction, scalar_trampoline};
use crate::index::{IndexCapabilities, IndexNegotiation};
use crate::marshal;
use crate::provider::{FindFunctionOut, Sqlite3Api, sqlite3_vtab, sqlite3_vtab_cursor};
use crate::value::native_values;

use super::module::{Module, VTabConnection};
use super::native::NativeModule;
use super::table::{NativeHandle, VirtualTable, VirtualTableCursor};

/// Registration-time settings for a [`ModuleHost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleOptions {
    /// Log every error written to a table's error slot.
    pub log_errors: bool,
    /// Log panics caught at the callback boundary.
    pub log_exceptions: bool,
    /// `iVersion` of the registered `sqlite3_module`.
    pub module_version: i32,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            log_errors: true,
            log_exceptions: true,
            module_version: 2,
        }
    }
}

/// Owning table, argument count, function name.
type FunctionKey = (NativeHandle, i32, String);

/// Adapts a [`Module`] to the raw callback surface.
///
/// Owns every table and cursor the module creates, keyed by the address of
/// the native struct handed to the engine, plus every function returned
/// from [`Module::find_function`] for the lifetime of the table it was
/// found on.
pub struct ModuleHost<P: Sqlite3Api, M: Module<P>> {
    api: *const P,
    name: String,
    module: M,
    options: ModuleOptions,
    capabilities: IndexCapabilities,
    tables: HashMap<NativeHandle, VirtualTable<M::Table>>,
    cursors: HashMap<NativeHandle, VirtualTableCursor<M::Cursor>>,
    functions: HashMap<FunctionKey, Box<ScalarState<P, VTabFunction<P>>>>,
}

impl<P: Sqlite3Api, M: Module<P>> ModuleHost<P, M> {
    pub fn new(api: &P, name: &str, module: M, options: ModuleOptions) -> Self {
        Self {
            api: api as *const P,
            name: name.to_owned(),
            module,
            options,
            capabilities: IndexCapabilities::for_provider(api),
            tables: HashMap::new(),
            cursors: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn options(&self) -> ModuleOptions {
        self.options
    }

    pub fn capabilities(&self) -> IndexCapabilities {
        self.capabilities
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Table registered under the native struct `handle`.
    pub fn table(&self, handle: NativeHandle) -> Option<&VirtualTable<M::Table>> {
        self.tables.get(&handle)
    }

    /// Cursor registered under the native struct `handle`.
    pub fn cursor(&self, handle: NativeHandle) -> Option<&VirtualTableCursor<M::Cursor>> {
        self.cursors.get(&handle)
    }

    fn api<'a>(&self) -> &'a P {
        unsafe { &*self.api }
    }

    fn guard<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => {
                let message = format!(
                    "panic in virtual table module \"{}\": {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
                if self.options.log_exceptions {
                    tracing::error!(module = %self.name, panic = %message, "virtual table callback panicked");
                }
                Err(Error::with_message(crate::error::ErrorCode::Error, message))
            }
        }
    }

    /// Replace the error message of `vtab`, freeing the previous one.
    fn set_table_error(&self, vtab: *mut sqlite3_vtab, message: &str) {
        if self.options.log_errors {
            tracing::warn!(module = %self.name, error = message, "virtual table error");
        }
        if vtab.is_null() {
            return;
        }
        let api = self.api();
        unsafe {
            marshal::free(api, (*vtab).z_err_msg as *mut c_void);
            (*vtab).z_err_msg = marshal::alloc_utf8(api, message);
        }
    }

    fn finish(&self, vtab: *mut sqlite3_vtab, result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(err) => self.fail(vtab, &err),
        }
    }

    fn fail(&self, vtab: *mut sqlite3_vtab, err: &Error) -> i32 {
        self.set_table_error(vtab, &err.to_string());
        err.result_code()
    }

    fn table_mut(
        tables: &mut HashMap<NativeHandle, VirtualTable<M::Table>>,
        handle: NativeHandle,
    ) -> Result<&mut VirtualTable<M::Table>> {
        tables
            .get_mut(&handle)
            .ok_or_else(|| Error::not_found(format!("virtual table {handle} not found")))
    }

    fn cursor_parts<'h>(
        tables: &'h HashMap<NativeHandle, VirtualTable<M::Table>>,
        cursors: &'h mut HashMap<NativeHandle, VirtualTableCursor<M::Cursor>>,
        handle: NativeHandle,
    ) -> Result<(&'h VirtualTable<M::Table>, &'h mut VirtualTableCursor<M::Cursor>)> {
        let cursor = cursors
            .get_mut(&handle)
            .ok_or_else(|| Error::not_found(format!("virtual table cursor {handle} not found")))?;
        let table = tables.get(&cursor.table()).ok_or_else(|| {
            Error::not_found(format!("virtual table {} not found", cursor.table()))
        })?;
        Ok((table, cursor))
    }

    fn create_table(
        &mut self,
        db: *mut P::Db,
        args: Vec<String>,
        connect: bool,
    ) -> Result<*mut sqlite3_vtab> {
        let api = self.api();
        let db = NonNull::new(db).ok_or_else(|| Error::invalid_state("database handle is null"))?;
        let conn = VTabConnection::new(api, db);
        let (schema, state) = if connect {
            self.module.connect(&conn, &args)?
        } else {
            self.module.create(&conn, &args)?
        };
        conn.declare_vtab(&schema)?;
        let native = marshal::alloc_native_table(api, self as *mut Self as *mut c_void);
        if native.is_null() {
            return Err(Error::no_memory("out of memory allocating virtual table"));
        }
        let handle = NativeHandle::from_ptr(native);
        let mut table = VirtualTable::new(args, state);
        table.set_handle(handle);
        tracing::debug!(
            module = %self.name,
            table = table.table_name().unwrap_or_default(),
            %handle,
            connect,
            "virtual table registered"
        );
        self.tables.insert(handle, table);
        Ok(native as *mut sqlite3_vtab)
    }

    unsafe fn create_or_connect(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
        connect: bool,
    ) -> i32 {
        if !out_err.is_null() {
            unsafe { *out_err = core::ptr::null_mut() };
        }
        let result = if out_vtab.is_null() {
            Err(Error::invalid_state("virtual table output pointer is null"))
        } else {
            let args = unsafe { marshal::parse_args(argc, argv) };
            self.guard(|host| host.create_table(db, args, connect))
        };
        match result {
            Ok(native) => {
                unsafe { *out_vtab = native };
                0
            }
            Err(err) => {
                let message = err.to_string();
                if self.options.log_errors {
                    tracing::warn!(module = %self.name, error = %message, "virtual table create failed");
                }
                if !out_err.is_null() {
                    unsafe { *out_err = marshal::alloc_utf8(self.api(), &message) as *mut u8 };
                }
                err.result_code()
            }
        }
    }

    unsafe fn release_table(&mut self, vtab: *mut sqlite3_vtab, destroy: bool) -> i32 {
        let handle = NativeHandle::from_ptr(vtab);
        let result = self.guard(|host| {
            let table = Self::table_mut(&mut host.tables, handle)?;
            if destroy {
                host.module.destroy(table)
            } else {
                host.module.disconnect(table)
            }
        });
        self.tables.remove(&handle);
        self.functions.retain(|(table, _, _), _| *table != handle);
        tracing::debug!(module = %self.name, %handle, destroy, "virtual table released");
        let rc = match result {
            Ok(()) => 0,
            Err(err) => {
                if self.options.log_errors {
                    tracing::warn!(module = %self.name, error = %err, "virtual table release failed");
                }
                err.result_code()
            }
        };
        unsafe { marshal::free_native_table(self.api(), vtab) };
        rc
    }

    fn with_table(
        &mut self,
        vtab: *mut sqlite3_vtab,
        f: impl FnOnce(&mut M, &mut VirtualTable<M::Table>) -> Result<()>,
    ) -> i32 {
        let handle = NativeHandle::from_ptr(vtab);
        let result = self.guard(|host| {
            let table = Self::table_mut(&mut host.tables, handle)?;
            f(&mut host.module, table)
        });
        self.finish(vtab, result)
    }

    fn with_cursor(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        f: impl FnOnce(
            &mut M,
            &VirtualTable<M::Table>,
            &mut VirtualTableCursor<M::Cursor>,
        ) -> Result<()>,
    ) -> i32 {
        let handle = NativeHandle::from_ptr(cursor);
        let result = self.guard(|host| {
            let (table, state) = Self::cursor_parts(&host.tables, &mut host.cursors, handle)?;
            f(&mut host.module, table, state)
        });
        self.finish(owning_table(cursor), result)
    }
}

fn owning_table(cursor: *mut sqlite3_vtab_cursor) -> *mut sqlite3_vtab {
    if cursor.is_null() {
        return core::ptr::null_mut();
    }
    unsafe { (*cursor).p_vtab }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl<P: Sqlite3Api, M: Module<P>> NativeModule<P> for ModuleHost<P, M> {
    unsafe fn x_create(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32 {
        unsafe { self.create_or_connect(db, argc, argv, out_vtab, out_err, false) }
    }

    unsafe fn x_connect(
        &mut self,
        db: *mut P::Db,
        argc: i32,
        argv: *const *const u8,
        out_vtab: *mut *mut sqlite3_vtab,
        out_err: *mut *mut u8,
    ) -> i32 {
        unsafe { self.create_or_connect(db, argc, argv, out_vtab, out_err, true) }
    }

    unsafe fn x_best_index(&mut self, vtab: *mut sqlite3_vtab, info: *mut c_void) -> i32 {
        let api = self.api();
        let handle = NativeHandle::from_ptr(vtab);
        let result = self.guard(|host| {
            let caps = host.capabilities;
            let mut index = unsafe { IndexNegotiation::from_native(caps, info, false)? };
            let table = Self::table_mut(&mut host.tables, handle)?;
            host.module.best_index(table, &mut index)?;
            unsafe { index.to_native(api, caps, info, false) }
        });
        self.finish(vtab, result)
    }

    unsafe fn x_disconnect(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        unsafe { self.release_table(vtab, false) }
    }

    unsafe fn x_destroy(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        unsafe { self.release_table(vtab, true) }
    }

    unsafe fn x_open(
        &mut self,
        vtab: *mut sqlite3_vtab,
        out_cursor: *mut *mut sqlite3_vtab_cursor,
    ) -> i32 {
        let api = self.api();
        let handle = NativeHandle::from_ptr(vtab);
        let result = self.guard(|host| {
            if out_cursor.is_null() {
                return Err(Error::invalid_state("cursor output pointer is null"));
            }
            let table = Self::table_mut(&mut host.tables, handle)?;
            let state = host.module.open(table)?;
            let native = marshal::alloc_native_cursor(api, vtab);
            if native.is_null() {
                return Err(Error::no_memory("out of memory allocating virtual table cursor"));
            }
            let cursor_handle = NativeHandle::from_ptr(native);
            host.cursors.insert(cursor_handle, VirtualTableCursor::new(handle, state));
            tracing::debug!(module = %host.name, table = %handle, cursor = %cursor_handle, "cursor opened");
            unsafe { *out_cursor = native };
            Ok(())
        });
        self.finish(vtab, result)
    }

    unsafe fn x_close(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        let handle = NativeHandle::from_ptr(cursor);
        let result = self.guard(|host| {
            let (table, state) = Self::cursor_parts(&host.tables, &mut host.cursors, handle)?;
            host.module.close(table, state)
        });
        let vtab = owning_table(cursor);
        self.cursors.remove(&handle);
        tracing::debug!(module = %self.name, cursor = %handle, "cursor closed");
        let rc = self.finish(vtab, result);
        marshal::free_native_cursor(self.api(), cursor);
        rc
    }

    unsafe fn x_filter(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        idx_num: i32,
        idx_str: *const u8,
        argc: i32,
        argv: *mut *mut P::Value,
    ) -> i32 {
        let api = self.api();
        self.with_cursor(cursor, |module, table, state| {
            let index_string = unsafe { marshal::utf8_from_native(idx_str, None) };
            let mut values = unsafe { native_values(api, argc, argv) };
            module.filter(table, state, idx_num, index_string.as_deref(), &mut values)
        })
    }

    unsafe fn x_next(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        self.with_cursor(cursor, |module, table, state| module.next(table, state))
    }

    unsafe fn x_eof(&mut self, cursor: *mut sqlite3_vtab_cursor) -> i32 {
        let mut at_end = true;
        let rc = self.with_cursor(cursor, |module, table, state| {
            at_end = module.eof(table, state)?;
            Ok(())
        });
        if rc != 0 { 1 } else { i32::from(at_end) }
    }

    unsafe fn x_column(
        &mut self,
        cursor: *mut sqlite3_vtab_cursor,
        ctx: *mut P::Context,
        column: i32,
    ) -> i32 {
        let context = Context::from_raw(self.api(), ctx);
        self.with_cursor(cursor, |module, table, state| {
            module.column(table, state, &context, column)
        })
    }

    unsafe fn x_rowid(&mut self, cursor: *mut sqlite3_vtab_cursor, out_rowid: *mut i64) -> i32 {
        self.with_cursor(cursor, |module, table, state| {
            if out_rowid.is_null() {
                return Err(Error::invalid_state("rowid output pointer is null"));
            }
            let rowid = module.row_id(table, state)?;
            unsafe { *out_rowid = rowid };
            Ok(())
        })
    }

    unsafe fn x_update(
        &mut self,
        vtab: *mut sqlite3_vtab,
        argc: i32,
        argv: *mut *mut P::Value,
        out_rowid: *mut i64,
    ) -> i32 {
        let api = self.api();
        self.with_table(vtab, |module, table| {
            let mut values = unsafe { native_values(api, argc, argv) };
            if let Some(rowid) = module.update(table, &mut values)? {
                if !out_rowid.is_null() {
                    unsafe { *out_rowid = rowid };
                }
            }
            Ok(())
        })
    }

    unsafe fn x_begin(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        self.with_table(vtab, |module, table| module.begin(table))
    }

    unsafe fn x_sync(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        self.with_table(vtab, |module, table| module.sync(table))
    }

    unsafe fn x_commit(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        self.with_table(vtab, |module, table| module.commit(table))
    }

    unsafe fn x_rollback(&mut self, vtab: *mut sqlite3_vtab) -> i32 {
        self.with_table(vtab, |module, table| module.rollback(table))
    }

    unsafe fn x_find_function(
        &mut self,
        vtab: *mut sqlite3_vtab,
        n_args: i32,
        name: *const u8,
        out_func: FindFunctionOut<P>,
        out_arg: *mut *mut c_void,
    ) -> i32 {
        let handle = NativeHandle::from_ptr(vtab);
        let result = self.guard(|host| {
            if out_func.is_null() || out_arg.is_null() {
                return Ok(false);
            }
            let Some(name) = (unsafe { marshal::utf8_from_native(name, None) }) else {
                return Ok(false);
            };
            let table = Self::table_mut(&mut host.tables, handle)?;
            let Some(func) = host.module.find_function(table, n_args, &name) else {
                return Ok(false);
            };
            let api = host.api;
            // Statements prepared earlier may still hold this pArg, so a
            // published entry is never replaced while its table lives.
            let state = match host.functions.entry((handle, n_args, name)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(Box::new(ScalarState { api, func })),
            };
            let state_ptr: *mut ScalarState<P, VTabFunction<P>> = &mut **state;
            unsafe {
                *out_func = Some(scalar_trampoline::<P, VTabFunction<P>>);
                *out_arg = state_ptr as *mut c_void;
            }
            Ok(true)
        });
        match result {
            Ok(found) => i32::from(found),
            Err(err) => {
                if self.options.log_errors {
                    tracing::warn!(module = %self.name, error = %err, "find_function failed");
                }
                0
            }
        }
    }

    unsafe fn x_rename(&mut self, vtab: *mut sqlite3_vtab, new_name: *const u8) -> i32 {
        self.with_table(vtab, |module, table| {
            let new_name = unsafe { marshal::utf8_from_native(new_name, None) }
                .ok_or_else(|| Error::invalid_state("new table name is null"))?;
            module.rename(table, &new_name)
        })
    }

    unsafe fn x_savepoint(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        self.with_table(vtab, |module, table| module.savepoint(table, savepoint))
    }

    unsafe fn x_release(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        self.with_table(vtab, |module, table| module.release(table, savepoint))
    }

    unsafe fn x_rollback_to(&mut self, vtab: *mut sqlite3_vtab, savepoint: i32) -> i32 {
        self.with_table(vtab, |module, table| module.rollback_to(table, savepoint))
    }
}
