//! In-crate provider used by unit tests.

use core::cell::RefCell;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::provider::{
    ApiVersion, FeatureSet, FunctionFlags, OpenOptions, RawBytes, ScalarCallback, Sqlite3Api,
    ValueType, sqlite3_module,
};
use crate::value::Value;

pub(crate) enum UnitValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Odd(i32),
}

#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    Value(Value),
    ZeroBlob(i32),
    Error(String),
    ErrorCode(i32),
}

#[derive(Default)]
pub(crate) struct UnitContext {
    pub(crate) outcomes: RefCell<Vec<Outcome>>,
}

#[derive(Default)]
pub(crate) struct UnitApi {
    pub(crate) value_reads: AtomicUsize,
    pub(crate) mallocs: AtomicUsize,
    pub(crate) frees: AtomicUsize,
}

impl UnitApi {
    pub(crate) fn reads(&self) -> usize {
        self.value_reads.load(Ordering::SeqCst)
    }

    fn read(&self) {
        self.value_reads.fetch_add(1, Ordering::SeqCst);
    }

    fn value<'a>(v: NonNull<UnitValue>) -> &'a UnitValue {
        unsafe { &*v.as_ptr() }
    }

    fn push(ctx: NonNull<UnitContext>, outcome: Outcome) {
        unsafe { ctx.as_ref() }.outcomes.borrow_mut().push(outcome);
    }
}

unsafe impl Sqlite3Api for UnitApi {
    type Db = c_void;
    type Value = UnitValue;
    type Context = UnitContext;

    fn api_version(&self) -> ApiVersion {
        ApiVersion::new(3, 45, 0)
    }

    fn feature_set(&self) -> FeatureSet {
        FeatureSet::empty()
    }

    fn backend_name(&self) -> &'static str {
        "unit"
    }

    fn backend_version(&self) -> Option<ApiVersion> {
        None
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        self.mallocs.fetch_add(1, Ordering::SeqCst);
        unsafe { libc::malloc(size) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if !ptr.is_null() {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
        unsafe { libc::free(ptr) }
    }

    unsafe fn open(&self, _filename: &str, _options: OpenOptions<'_>) -> Result<NonNull<c_void>> {
        Err(Error::feature_unavailable("unit provider has no databases"))
    }

    unsafe fn close(&self, _db: NonNull<c_void>) -> Result<()> {
        Ok(())
    }

    unsafe fn create_function_v2(
        &self,
        _db: NonNull<c_void>,
        _name: &str,
        _n_args: i32,
        _flags: FunctionFlags,
        _x_func: Option<ScalarCallback<Self>>,
        _user_data: *mut c_void,
        _drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        Err(Error::feature_unavailable("unit provider has no functions"))
    }

    unsafe fn result_null(&self, ctx: NonNull<UnitContext>) {
        Self::push(ctx, Outcome::Value(Value::Null));
    }

    unsafe fn result_int64(&self, ctx: NonNull<UnitContext>, v: i64) {
        Self::push(ctx, Outcome::Value(Value::Integer(v)));
    }

    unsafe fn result_double(&self, ctx: NonNull<UnitContext>, v: f64) {
        Self::push(ctx, Outcome::Value(Value::Float(v)));
    }

    unsafe fn result_text(&self, ctx: NonNull<UnitContext>, v: &str) {
        Self::push(ctx, Outcome::Value(Value::Text(v.to_owned())));
    }

    unsafe fn result_blob(&self, ctx: NonNull<UnitContext>, v: &[u8]) {
        Self::push(ctx, Outcome::Value(Value::Blob(v.to_vec())));
    }

    unsafe fn result_zeroblob(&self, ctx: NonNull<UnitContext>, n: i32) {
        Self::push(ctx, Outcome::ZeroBlob(n));
    }

    unsafe fn result_error(&self, ctx: NonNull<UnitContext>, msg: &str) {
        Self::push(ctx, Outcome::Error(msg.to_owned()));
    }

    unsafe fn result_error_code(&self, ctx: NonNull<UnitContext>, code: i32) {
        Self::push(ctx, Outcome::ErrorCode(code));
    }

    unsafe fn result_value(&self, ctx: NonNull<UnitContext>, v: NonNull<UnitValue>) {
        self.read();
        let value = match Self::value(v) {
            UnitValue::Null | UnitValue::Odd(_) => Value::Null,
            UnitValue::Int(i) => Value::Integer(*i),
            UnitValue::Float(f) => Value::Float(*f),
            UnitValue::Text(s) => Value::Text(s.clone()),
            UnitValue::Blob(b) => Value::Blob(b.clone()),
        };
        Self::push(ctx, Outcome::Value(value));
    }

    unsafe fn user_data(_ctx: NonNull<UnitContext>) -> *mut c_void {
        core::ptr::null_mut()
    }

    unsafe fn value_type(&self, v: NonNull<UnitValue>) -> ValueType {
        self.read();
        match Self::value(v) {
            UnitValue::Null => ValueType::Null,
            UnitValue::Int(_) => ValueType::Integer,
            UnitValue::Float(_) => ValueType::Float,
            UnitValue::Text(_) => ValueType::Text,
            UnitValue::Blob(_) => ValueType::Blob,
            UnitValue::Odd(code) => ValueType::from_code(*code),
        }
    }

    unsafe fn value_int64(&self, v: NonNull<UnitValue>) -> i64 {
        self.read();
        match Self::value(v) {
            UnitValue::Int(i) => *i,
            UnitValue::Float(f) => *f as i64,
            _ => 0,
        }
    }

    unsafe fn value_double(&self, v: NonNull<UnitValue>) -> f64 {
        self.read();
        match Self::value(v) {
            UnitValue::Int(i) => *i as f64,
            UnitValue::Float(f) => *f,
            _ => 0.0,
        }
    }

    unsafe fn value_text(&self, v: NonNull<UnitValue>) -> RawBytes {
        self.read();
        match Self::value(v) {
            UnitValue::Text(s) => RawBytes {
                ptr: s.as_ptr(),
                len: s.len(),
            },
            UnitValue::Blob(b) => RawBytes {
                ptr: b.as_ptr(),
                len: b.len(),
            },
            _ => RawBytes::empty(),
        }
    }

    unsafe fn value_blob(&self, v: NonNull<UnitValue>) -> RawBytes {
        unsafe { self.value_text(v) }
    }

    unsafe fn value_bytes(&self, v: NonNull<UnitValue>) -> i32 {
        unsafe { self.value_text(v) }.len as i32
    }

    unsafe fn declare_vtab(&self, _db: NonNull<c_void>, _schema: &str) -> Result<()> {
        Ok(())
    }

    unsafe fn create_module_v2(
        &self,
        _db: NonNull<c_void>,
        _name: &str,
        _module: &'static sqlite3_module<Self>,
        _user_data: *mut c_void,
        _drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        Err(Error::feature_unavailable("unit provider has no modules"))
    }
}
