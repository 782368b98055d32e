//! SQLite virtual table modules over a backend-agnostic provider SPI.

mod connection;
mod error;
mod function;
mod index;
pub mod marshal;
mod provider;
#[cfg(test)]
mod testing;
mod value;
mod vtab;

pub use crate::connection::Connection;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::function::{Context, VTabFunction};
pub use crate::index::{
    ConstraintLayout, IndexCapabilities, IndexConstraint, IndexConstraintOp,
    IndexConstraintUsage, IndexFlags, IndexInfoLayout, IndexInputs, IndexNegotiation,
    IndexOrderBy, IndexOutputs, NativeIndexInfo, OrderByLayout, UsageLayout,
};
pub use crate::provider::{
    ApiVersion, FeatureSet, FindFunctionOut, FunctionFlags, OpenFlags, OpenOptions, RawBytes,
    ScalarCallback, Sqlite3Api, ValueType,
};
pub use crate::value::{NativeValue, Value, ValueRef, native_values};
pub use crate::vtab::{
    ForwardingModule, MAX_MODULE_VERSION, Module, ModuleHost, ModuleOptions, NativeHandle,
    NativeModule, SequenceModule, VTabConnection, VirtualTable, VirtualTableCursor,
    native_module_table,
};

pub use crate::provider::{sqlite3_module, sqlite3_vtab, sqlite3_vtab_cursor};
