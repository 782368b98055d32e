use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::provider::{RawBytes, Sqlite3Api, ValueType};

/// Owned value in one of SQLite's five storage classes. `Value::Null` is the
/// database-NULL marker.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value.into())
            }
        })*
    };
}

value_from!(i64 => Integer, f64 => Float, String => Text, &str => Text, Vec<u8> => Blob);

/// Value borrowed from the engine or from a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Float(f64),
    Text(&'a str),
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            ValueRef::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_owned(&self) -> Value {
        match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Float(v) => Value::Float(v),
            ValueRef::Text(v) => Value::Text(v.to_owned()),
            ValueRef::Blob(v) => Value::Blob(v.to_vec()),
        }
    }

    /// Text bytes from the engine; invalid UTF-8 reads as a blob.
    ///
    /// # Safety
    /// `raw` must stay valid for `'a`.
    pub unsafe fn from_raw_text(raw: RawBytes) -> ValueRef<'a> {
        match unsafe { raw.as_str() } {
            Some(text) => ValueRef::Text(text),
            None => ValueRef::Blob(unsafe { raw.as_slice() }),
        }
    }

    /// # Safety
    /// `raw` must stay valid for `'a`.
    pub unsafe fn from_raw_blob(raw: RawBytes) -> ValueRef<'a> {
        ValueRef::Blob(unsafe { raw.as_slice() })
    }
}

/// Borrow a native value as a [`ValueRef`]. Unrecognized storage classes read
/// as NULL.
///
/// # Safety
/// `value` must be a live engine value for `'a`.
unsafe fn value_ref_from_raw<'a, P: Sqlite3Api>(
    api: &P,
    value: NonNull<P::Value>,
) -> ValueRef<'a> {
    match unsafe { api.value_type(value) } {
        ValueType::Integer => ValueRef::Integer(unsafe { api.value_int64(value) }),
        ValueType::Float => ValueRef::Float(unsafe { api.value_double(value) }),
        ValueType::Text => unsafe { ValueRef::from_raw_text(api.value_text(value)) },
        ValueType::Blob => unsafe { ValueRef::from_raw_blob(api.value_blob(value)) },
        ValueType::Null | ValueType::Unknown(_) => ValueRef::Null,
    }
}

/// Engine-owned value passed into a callback, optionally snapshotted so it
/// can outlive that callback.
///
/// Until [`persist`](Self::persist) succeeds every getter reads through the
/// provider. Afterwards the native handle is dropped and never touched
/// again; the snapshot is available through [`value`](Self::value).
pub struct NativeValue<'a, P: Sqlite3Api> {
    api: &'a P,
    handle: Option<NonNull<P::Value>>,
    affinity: Option<ValueType>,
    persisted: Option<Value>,
}

impl<'a, P: Sqlite3Api> NativeValue<'a, P> {
    /// Wrap a raw `sqlite3_value*`; null becomes an empty value that reads as
    /// defaults.
    pub fn new(api: &'a P, handle: *mut P::Value) -> Self {
        Self {
            api,
            handle: NonNull::new(handle),
            affinity: None,
            persisted: None,
        }
    }

    /// Native handle, `None` once persisted or when built from null.
    pub fn handle(&self) -> Option<NonNull<P::Value>> {
        self.handle
    }

    /// Storage class. Read once from the engine and cached; after
    /// persistence this is the snapshot's class.
    pub fn type_affinity(&mut self) -> ValueType {
        if let Some(value) = &self.persisted {
            return value.value_type();
        }
        if let Some(affinity) = self.affinity {
            return affinity;
        }
        let affinity = match self.handle {
            Some(handle) => unsafe { self.api.value_type(handle) },
            None => ValueType::Null,
        };
        self.affinity = Some(affinity);
        affinity
    }

    pub fn int(&self) -> i32 {
        match self.handle {
            Some(handle) => unsafe { self.api.value_int(handle) },
            None => 0,
        }
    }

    pub fn int64(&self) -> i64 {
        match self.handle {
            Some(handle) => unsafe { self.api.value_int64(handle) },
            None => 0,
        }
    }

    pub fn double(&self) -> f64 {
        match self.handle {
            Some(handle) => unsafe { self.api.value_double(handle) },
            None => 0.0,
        }
    }

    /// Text view, decoded lossily. `None` on a null handle.
    pub fn string(&self) -> Option<String> {
        let handle = self.handle?;
        let raw = unsafe { self.api.value_text(handle) };
        if raw.ptr.is_null() {
            return Some(String::new());
        }
        Some(String::from_utf8_lossy(unsafe { raw.as_slice() }).into_owned())
    }

    /// Borrowed blob bytes, valid only while the engine value is.
    pub fn blob(&self) -> Option<&'a [u8]> {
        let handle = self.handle?;
        Some(unsafe { self.api.value_blob(handle).as_slice() })
    }

    /// Owned copy of the blob bytes.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.blob().map(<[u8]>::to_vec)
    }

    /// Borrowed typed view; NULL on a null handle or unknown class.
    pub fn as_value_ref(&self) -> ValueRef<'a> {
        match self.handle {
            Some(handle) => unsafe { value_ref_from_raw(self.api, handle) },
            None => ValueRef::Null,
        }
    }

    /// Owned value for the current storage class. `None` when the class is
    /// not one SQLite defines.
    pub fn object(&mut self) -> Option<Value> {
        if let Some(value) = &self.persisted {
            return Some(value.clone());
        }
        match self.type_affinity() {
            ValueType::Null => Some(Value::Null),
            ValueType::Integer => Some(Value::Integer(self.int64())),
            ValueType::Float => Some(Value::Float(self.double())),
            ValueType::Text => Some(Value::Text(self.string().unwrap_or_default())),
            ValueType::Blob => Some(Value::Blob(self.bytes().unwrap_or_default())),
            ValueType::Unknown(_) => None,
        }
    }

    /// Snapshot the value and release the native handle. Returns `false`
    /// (leaving the value untouched) for an unrecognized storage class.
    pub fn persist(&mut self) -> bool {
        if self.persisted.is_some() {
            return true;
        }
        let Some(value) = self.object() else {
            return false;
        };
        self.persisted = Some(value);
        self.handle = None;
        true
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    /// Snapshot taken by [`persist`](Self::persist).
    pub fn value(&self) -> Result<&Value> {
        self.persisted
            .as_ref()
            .ok_or_else(|| Error::invalid_state("value has not been persisted"))
    }

    /// Take the snapshot out of this wrapper.
    pub fn into_value(self) -> Result<Value> {
        self.persisted
            .ok_or_else(|| Error::invalid_state("value has not been persisted"))
    }
}

/// Wrap an `argv` array of engine values.
///
/// # Safety
/// `argv` must be null or point to `argc` value pointers.
pub unsafe fn native_values<'a, P: Sqlite3Api>(
    api: &'a P,
    argc: i32,
    argv: *mut *mut P::Value,
) -> Vec<NativeValue<'a, P>> {
    let argc = if argc < 0 { 0 } else { argc as usize };
    if argc == 0 || argv.is_null() {
        return Vec::new();
    }
    let values = unsafe { core::slice::from_raw_parts(argv, argc) };
    values.iter().map(|value| NativeValue::new(api, *value)).collect()
}
