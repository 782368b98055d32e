use super::*;
use sqlite_vtab_provider::{ScalarCallback, sqlite3_module};

fn drop_registration_user_data(
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
) {
    if let Some(drop_user_data) = drop_user_data {
        drop_user_data(user_data);
    }
}

fn registration_name_or_drop(
    name: &str,
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
    error_message: &'static str,
) -> Result<CString> {
    match CString::new(name) {
        Ok(name) => Ok(name),
        Err(_) => {
            drop_registration_user_data(user_data, drop_user_data);
            Err(Error::with_message(ErrorCode::Misuse, error_message))
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "libsqlite3"
    }

    fn backend_version(&self) -> Option<ApiVersion> {
        Some(self.api_version)
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        if size > i32::MAX as usize {
            return null_mut();
        }
        (self.fns.malloc)(size as c_int)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.fns.free)(ptr);
    }

    unsafe fn open(&self, filename: &str, options: OpenOptions<'_>) -> Result<NonNull<Self::Db>> {
        let filename = CString::new(filename)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "filename contains NUL"))?;
        let vfs = match options.vfs {
            Some(vfs) => Some(
                CString::new(vfs)
                    .map_err(|_| Error::with_message(ErrorCode::Misuse, "vfs contains NUL"))?,
            ),
            None => None,
        };
        let mut db = null_mut();
        let flags = map_open_flags(options.flags);
        let vfs_ptr = vfs.as_ref().map(|s| s.as_ptr()).unwrap_or(null());
        let rc = (self.fns.open_v2)(filename.as_ptr(), &mut db, flags, vfs_ptr);
        if rc != SQLITE_OK {
            let err = self.error_from_rc(rc, NonNull::new(db));
            if !db.is_null() {
                let _ = (self.fns.close)(db);
            }
            return Err(err);
        }
        NonNull::new(db).ok_or_else(|| Error::new(ErrorCode::NoMem))
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close)(db.as_ptr());
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }

    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        x_func: Option<ScalarCallback<Self>>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        let name = registration_name_or_drop(
            name,
            user_data,
            drop_user_data,
            "function name contains NUL",
        )?;
        let flags = map_function_flags(flags);
        let rc = (self.fns.create_function_v2)(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            flags,
            user_data,
            x_func,
            None,
            None,
            drop_user_data,
        );
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }

    unsafe fn overload_function(&self, db: NonNull<Self::Db>, name: &str, n_args: i32) -> Result<()> {
        let overload = match self.fns.overload_function {
            Some(overload) => overload,
            None => return Err(Error::feature_unavailable("overload_function not available")),
        };
        let name = CString::new(name)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "function name contains NUL"))?;
        let rc = overload(db.as_ptr(), name.as_ptr(), n_args);
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &str) {
        match self.alloc_copy(v.as_bytes()) {
            Ok((ptr, dtor)) => {
                (self.fns.result_text)(
                    ctx.as_ptr(),
                    ptr as *const c_char,
                    clamp_len(v.len()),
                    dtor,
                );
            }
            Err(err) if err.code == ErrorCode::TooBig => (self.fns.result_error_toobig)(ctx.as_ptr()),
            Err(_) => (self.fns.result_error_nomem)(ctx.as_ptr()),
        }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => {
                (self.fns.result_blob)(ctx.as_ptr(), ptr, clamp_len(v.len()), dtor);
            }
            Err(err) if err.code == ErrorCode::TooBig => (self.fns.result_error_toobig)(ctx.as_ptr()),
            Err(_) => (self.fns.result_error_nomem)(ctx.as_ptr()),
        }
    }

    unsafe fn result_zeroblob(&self, ctx: NonNull<Self::Context>, n: i32) {
        (self.fns.result_zeroblob)(ctx.as_ptr(), n.max(0));
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &str) {
        (self.fns.result_error)(
            ctx.as_ptr(),
            msg.as_ptr() as *const c_char,
            clamp_len(msg.len()),
        );
    }

    unsafe fn result_error_code(&self, ctx: NonNull<Self::Context>, code: i32) {
        (self.fns.result_error_code)(ctx.as_ptr(), code);
    }

    unsafe fn result_error_toobig(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_error_toobig)(ctx.as_ptr());
    }

    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_error_nomem)(ctx.as_ptr());
    }

    unsafe fn result_value(&self, ctx: NonNull<Self::Context>, v: NonNull<Self::Value>) {
        (self.fns.result_value)(ctx.as_ptr(), v.as_ptr());
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        match USER_DATA_FN.get() {
            Some(f) => f(ctx.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32 {
        (self.fns.value_int)(v.as_ptr())
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_text)(v.as_ptr());
        if ptr.is_null() {
            return RawBytes::empty();
        }
        raw_bytes(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr()) as *const u8;
        if ptr.is_null() {
            return RawBytes::empty();
        }
        raw_bytes(ptr, (self.fns.value_bytes)(v.as_ptr()))
    }

    unsafe fn value_bytes(&self, v: NonNull<Self::Value>) -> i32 {
        (self.fns.value_bytes)(v.as_ptr())
    }

    unsafe fn declare_vtab(&self, db: NonNull<Self::Db>, schema: &str) -> Result<()> {
        let schema = CString::new(schema)
            .map_err(|_| Error::with_message(ErrorCode::Misuse, "schema contains NUL"))?;
        let rc = (self.fns.declare_vtab)(db.as_ptr(), schema.as_ptr());
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }

    unsafe fn create_module_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &str,
        module: &'static sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        let create = match self.fns.create_module_v2 {
            Some(create) => create,
            None => {
                drop_registration_user_data(user_data, drop_user_data);
                return Err(Error::feature_unavailable("create_module_v2 not available"));
            }
        };
        let name =
            registration_name_or_drop(name, user_data, drop_user_data, "module name contains NUL")?;
        // On failure SQLite invokes drop_user_data itself.
        let rc = create(
            db.as_ptr(),
            name.as_ptr(),
            module as *const _ as *const c_void,
            user_data,
            drop_user_data,
        );
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, Some(db)))
        }
    }
}
