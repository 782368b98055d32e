use core::ffi::c_void;
use core::ptr::NonNull;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::provider::{FeatureSet, FunctionFlags, Sqlite3Api};
use crate::value::{NativeValue, Value, ValueRef, native_values};

/// Result slot of the callback currently running (`sqlite3_context*`).
///
/// Setters write through to the engine immediately. Calling more than one
/// setter is allowed; the last write wins.
pub struct Context<'p, P: Sqlite3Api> {
    api: &'p P,
    ctx: Option<NonNull<P::Context>>,
}

impl<'p, P: Sqlite3Api> Context<'p, P> {
    pub(crate) fn new(api: &'p P, ctx: NonNull<P::Context>) -> Self {
        Self {
            api,
            ctx: Some(ctx),
        }
    }

    /// Wrap a raw context pointer. Every setter fails on null.
    pub fn from_raw(api: &'p P, ctx: *mut P::Context) -> Self {
        Self {
            api,
            ctx: NonNull::new(ctx),
        }
    }

    fn handle(&self) -> Result<NonNull<P::Context>> {
        self.ctx
            .ok_or_else(|| Error::invalid_state("function context handle is null"))
    }

    pub fn set_null(&self) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_null(ctx) };
        Ok(())
    }

    pub fn set_int(&self, v: i32) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_int(ctx, v) };
        Ok(())
    }

    pub fn set_int64(&self, v: i64) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_int64(ctx, v) };
        Ok(())
    }

    pub fn set_double(&self, v: f64) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_double(ctx, v) };
        Ok(())
    }

    /// Set text result (provider must copy or retain the bytes as needed).
    pub fn set_text(&self, v: &str) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_text(ctx, v) };
        Ok(())
    }

    /// Set blob result (provider must copy or retain the bytes as needed).
    pub fn set_blob(&self, v: &[u8]) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_blob(ctx, v) };
        Ok(())
    }

    /// Set a blob of `n` zero bytes.
    pub fn set_zero_blob(&self, n: i32) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_zeroblob(ctx, n) };
        Ok(())
    }

    /// Report an error message.
    pub fn set_error(&self, msg: &str) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_error(ctx, msg) };
        Ok(())
    }

    /// Override the error code reported with the result.
    pub fn set_error_code(&self, code: i32) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_error_code(ctx, code) };
        Ok(())
    }

    pub fn set_error_too_big(&self) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_error_toobig(ctx) };
        Ok(())
    }

    pub fn set_error_no_memory(&self) -> Result<()> {
        let ctx = self.handle()?;
        unsafe { self.api.result_error_nomem(ctx) };
        Ok(())
    }

    /// Copy another engine value into the result. A persisted value is
    /// written from its snapshot.
    pub fn set_value(&self, value: &NativeValue<'_, P>) -> Result<()> {
        let ctx = self.handle()?;
        if let Ok(snapshot) = value.value() {
            return self.set_result(snapshot.clone());
        }
        match value.handle() {
            Some(handle) => unsafe { self.api.result_value(ctx, handle) },
            None => unsafe { self.api.result_null(ctx) },
        }
        Ok(())
    }

    /// Set result from an owned `Value`.
    pub fn set_result(&self, value: Value) -> Result<()> {
        match value {
            Value::Null => self.set_null(),
            Value::Integer(v) => self.set_int64(v),
            Value::Float(v) => self.set_double(v),
            Value::Text(v) => self.set_text(&v),
            Value::Blob(v) => self.set_blob(&v),
        }
    }

    /// Report `err`: its message, then its code when it has a specific one.
    pub fn set_failure(&self, err: &Error) -> Result<()> {
        self.set_error(err.message.as_deref().unwrap_or("sqlite function error"))?;
        let code = err.result_code();
        if code != 1 {
            self.set_error_code(code)?;
        }
        Ok(())
    }
}

/// Borrow a scalar call's `argv`; null entries read as NULL.
fn args_from_raw<'a, P: Sqlite3Api>(
    api: &'a P,
    argc: i32,
    argv: *mut *mut P::Value,
) -> Vec<ValueRef<'a>> {
    unsafe { native_values(api, argc, argv) }
        .iter()
        .map(NativeValue::as_value_ref)
        .collect()
}

/// Scalar function a virtual table hands back from `find_function`.
pub type VTabFunction<P> = Box<
    dyn for<'a> FnMut(&Context<'a, P>, &[ValueRef<'a>]) -> Result<Value> + Send + 'static,
>;

pub(crate) struct ScalarState<P: Sqlite3Api, F> {
    pub(crate) api: *const P,
    pub(crate) func: F,
}

pub(crate) extern "C" fn scalar_trampoline<P, F>(
    ctx: *mut P::Context,
    argc: i32,
    argv: *mut *mut P::Value,
) where
    P: Sqlite3Api,
    F: for<'a> FnMut(&Context<'a, P>, &[ValueRef<'a>]) -> Result<Value> + Send + 'static,
{
    let ctx = match NonNull::new(ctx) {
        Some(ctx) => ctx,
        None => return,
    };
    let user_data = unsafe { P::user_data(ctx) };
    if user_data.is_null() {
        return;
    }
    let state = unsafe { &mut *(user_data as *mut ScalarState<P, F>) };
    let api = unsafe { &*state.api };
    let context = Context::new(api, ctx);
    let args = args_from_raw(api, argc, argv);
    let out = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (state.func)(&context, &args)
    }));
    let _ = match out {
        Ok(Ok(value)) => context.set_result(value),
        Ok(Err(err)) => context.set_failure(&err),
        Err(_) => context.set_error("panic in sqlite function"),
    };
}

pub(crate) extern "C" fn drop_boxed<T>(ptr: *mut c_void) {
    if !ptr.is_null() {
        unsafe { drop(Box::from_raw(ptr as *mut T)) };
    }
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register a scalar function (xFunc).
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        func: F,
    ) -> Result<()>
    where
        F: for<'a> FnMut(&Context<'a, P>, &[ValueRef<'a>]) -> Result<Value> + Send + 'static,
    {
        if !self
            .api
            .feature_set()
            .contains(FeatureSet::CREATE_FUNCTION_V2)
        {
            return Err(Error::feature_unavailable("create_function_v2 unsupported"));
        }
        let state = Box::new(ScalarState {
            api: self.api as *const P,
            func,
        });
        let user_data = Box::into_raw(state) as *mut c_void;
        unsafe {
            self.api.create_function_v2(
                self.db,
                name,
                n_args,
                flags,
                Some(scalar_trampoline::<P, F>),
                user_data,
                Some(drop_boxed::<ScalarState<P, F>>),
            )
        }
    }
}
