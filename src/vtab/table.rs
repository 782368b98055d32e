use crate::error::{Error, Result};
use crate::index::IndexNegotiation;
use crate::provider::Sqlite3Api;
use crate::value::{NativeValue, Value};

/// Registry key derived from the address of a native table or cursor struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(usize);

impl NativeHandle {
    /// Key for the struct at `ptr`.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

const MODULE_NAME: usize = 0;
const DATABASE_NAME: usize = 1;
const TABLE_NAME: usize = 2;

/// A virtual table instance created by `CREATE VIRTUAL TABLE` or reconnected
/// by the engine.
///
/// `arguments` are the engine's xCreate/xConnect strings: module, database
/// and table name, then whatever followed the module name in SQL.
#[derive(Debug)]
pub struct VirtualTable<T> {
    arguments: Vec<String>,
    handle: Option<NativeHandle>,
    index: Option<IndexNegotiation>,
    state: T,
}

impl<T> VirtualTable<T> {
    pub fn new(arguments: Vec<String>, state: T) -> Self {
        Self {
            arguments,
            handle: None,
            index: None,
            state,
        }
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn module_name(&self) -> Option<&str> {
        self.arguments.get(MODULE_NAME).map(String::as_str)
    }

    pub fn database_name(&self) -> Option<&str> {
        self.arguments.get(DATABASE_NAME).map(String::as_str)
    }

    pub fn table_name(&self) -> Option<&str> {
        self.arguments.get(TABLE_NAME).map(String::as_str)
    }

    /// Arguments written after the module name in `CREATE VIRTUAL TABLE`.
    pub fn module_arguments(&self) -> &[String] {
        self.arguments.get(TABLE_NAME + 1..).unwrap_or(&[])
    }

    /// Native struct this table is registered under, once registered.
    pub fn handle(&self) -> Option<NativeHandle> {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: NativeHandle) {
        self.handle = Some(handle);
    }

    /// Most recent planner negotiation recorded by [`best_index`](Self::best_index).
    pub fn index(&self) -> Option<&IndexNegotiation> {
        self.index.as_ref()
    }

    /// Record `index` as the latest negotiation.
    pub fn best_index(&mut self, index: &IndexNegotiation) -> bool {
        self.index = Some(index.clone());
        true
    }

    /// Replace the table name. `false` when no table name was supplied.
    pub fn rename(&mut self, new_name: &str) -> bool {
        match self.arguments.get_mut(TABLE_NAME) {
            Some(name) => {
                *name = new_name.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

/// Scan position over a [`VirtualTable`].
///
/// Row indexes start at the invalid sentinel `0`; the first advance yields
/// `1`.
#[derive(Debug)]
pub struct VirtualTableCursor<C> {
    table: NativeHandle,
    row_index: i64,
    index_number: i32,
    index_string: Option<String>,
    values: Vec<Value>,
    state: C,
}

impl<C> VirtualTableCursor<C> {
    pub const INVALID_ROW_INDEX: i64 = 0;

    pub fn new(table: NativeHandle, state: C) -> Self {
        Self {
            table,
            row_index: Self::INVALID_ROW_INDEX,
            index_number: 0,
            index_string: None,
            values: Vec::new(),
            state,
        }
    }

    /// Native handle of the owning table.
    pub fn table(&self) -> NativeHandle {
        self.table
    }

    /// Remember the filter request, snapshotting every value.
    pub fn filter<P: Sqlite3Api>(
        &mut self,
        index_number: i32,
        index_string: Option<&str>,
        values: &mut [NativeValue<'_, P>],
    ) -> Result<()> {
        let mut persisted = Vec::with_capacity(values.len());
        for (i, value) in values.iter_mut().enumerate() {
            if !value.persist() {
                return Err(Error::with_message(
                    crate::error::ErrorCode::Error,
                    format!("filter value {i} could not be persisted"),
                ));
            }
            persisted.push(value.value()?.clone());
        }
        self.index_number = index_number;
        self.index_string = index_string.map(str::to_owned);
        self.values = persisted;
        Ok(())
    }

    pub fn index_number(&self) -> i32 {
        self.index_number
    }

    pub fn index_string(&self) -> Option<&str> {
        self.index_string.as_deref()
    }

    /// Values passed to the latest filter.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn row_index(&self) -> i64 {
        self.row_index
    }

    /// Advance and return the new row index.
    pub fn next_row_index(&mut self) -> i64 {
        self.row_index += 1;
        self.row_index
    }

    pub fn reset_row_index(&mut self) {
        self.row_index = Self::INVALID_ROW_INDEX;
    }

    pub fn state(&self) -> &C {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut C {
        &mut self.state
    }
}
