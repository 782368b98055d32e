use core::ptr::NonNull;

use crate::error::{Error, ErrorCode, Result};
use crate::function::{Context, VTabFunction};
use crate::index::IndexNegotiation;
use crate::provider::{FeatureSet, Sqlite3Api};
use crate::value::NativeValue;

use super::table::{VirtualTable, VirtualTableCursor};

/// Connection handed to [`Module::create`] / [`Module::connect`].
pub struct VTabConnection<'a, P: Sqlite3Api> {
    api: &'a P,
    db: NonNull<P::Db>,
}

impl<'a, P: Sqlite3Api> VTabConnection<'a, P> {
    pub(crate) fn new(api: &'a P, db: NonNull<P::Db>) -> Self {
        Self { api, db }
    }

    pub fn api(&self) -> &'a P {
        self.api
    }

    pub fn raw_handle(&self) -> NonNull<P::Db> {
        self.db
    }

    /// Declare the table's columns with a `CREATE TABLE` statement.
    pub fn declare_vtab(&self, schema: &str) -> Result<()> {
        unsafe { self.api.declare_vtab(self.db, schema) }
    }

    /// Make `name/n_args` resolvable so [`Module::find_function`] can
    /// overload it. Silently skipped when the backend cannot overload.
    pub fn declare_function(&self, n_args: i32, name: &str) -> Result<()> {
        if !self
            .api
            .feature_set()
            .contains(FeatureSet::OVERLOAD_FUNCTION)
        {
            tracing::debug!(function = name, n_args, "overload_function unavailable, skipped");
            return Ok(());
        }
        unsafe { self.api.overload_function(self.db, name, n_args) }
    }
}

/// Behavior of a virtual table module.
///
/// The dispatch layer owns every [`VirtualTable`] and [`VirtualTableCursor`]
/// and hands them to these methods by reference; a module only supplies the
/// per-table state `Table` and per-cursor state `Cursor`.
///
/// Errors are reported to the engine through the owning table's error slot
/// with the error's result code. Panics are caught and reported as
/// `SQLITE_ERROR`.
pub trait Module<P: Sqlite3Api>: Send + 'static {
    type Table: 'static;
    type Cursor: 'static;

    /// `CREATE VIRTUAL TABLE`. Returns the `CREATE TABLE` schema to declare
    /// and the table state.
    fn create(
        &mut self,
        conn: &VTabConnection<'_, P>,
        args: &[String],
    ) -> Result<(String, Self::Table)>;

    /// Reattach to a table created earlier (new connection, schema reload).
    fn connect(
        &mut self,
        conn: &VTabConnection<'_, P>,
        args: &[String],
    ) -> Result<(String, Self::Table)> {
        self.create(conn, args)
    }

    /// Answer one planner request. `index.outputs` starts with one default
    /// usage per constraint and engine defaults everywhere else.
    fn best_index(
        &mut self,
        table: &mut VirtualTable<Self::Table>,
        index: &mut IndexNegotiation,
    ) -> Result<()> {
        table.best_index(index);
        Ok(())
    }

    fn disconnect(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    /// `DROP TABLE`.
    fn destroy(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn open(&mut self, table: &mut VirtualTable<Self::Table>) -> Result<Self::Cursor>;

    fn close(
        &mut self,
        _table: &VirtualTable<Self::Table>,
        _cursor: &mut VirtualTableCursor<Self::Cursor>,
    ) -> Result<()> {
        Ok(())
    }

    /// Start a scan. `args` are the values selected by the chosen plan's
    /// `argv_index` entries; they die with this call unless persisted, which
    /// [`VirtualTableCursor::filter`] does.
    fn filter(
        &mut self,
        table: &VirtualTable<Self::Table>,
        cursor: &mut VirtualTableCursor<Self::Cursor>,
        index_number: i32,
        index_string: Option<&str>,
        args: &mut [NativeValue<'_, P>],
    ) -> Result<()>;

    fn next(
        &mut self,
        table: &VirtualTable<Self::Table>,
        cursor: &mut VirtualTableCursor<Self::Cursor>,
    ) -> Result<()>;

    fn eof(
        &mut self,
        table: &VirtualTable<Self::Table>,
        cursor: &mut VirtualTableCursor<Self::Cursor>,
    ) -> Result<bool>;

    fn column(
        &mut self,
        table: &VirtualTable<Self::Table>,
        cursor: &mut VirtualTableCursor<Self::Cursor>,
        ctx: &Context<'_, P>,
        column: i32,
    ) -> Result<()>;

    fn row_id(
        &mut self,
        table: &VirtualTable<Self::Table>,
        cursor: &mut VirtualTableCursor<Self::Cursor>,
    ) -> Result<i64>;

    /// INSERT, UPDATE or DELETE, in xUpdate's argument convention. Return
    /// the new rowid for an INSERT that let the table choose it.
    fn update(
        &mut self,
        table: &mut VirtualTable<Self::Table>,
        _values: &mut [NativeValue<'_, P>],
    ) -> Result<Option<i64>> {
        Err(Error::with_message(
            ErrorCode::Error,
            format!(
                "virtual table \"{}\" is read-only",
                table.table_name().unwrap_or_default()
            ),
        ))
    }

    fn begin(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self, _table: &mut VirtualTable<Self::Table>) -> Result<()> {
        Ok(())
    }

    fn savepoint(&mut self, _table: &mut VirtualTable<Self::Table>, _savepoint: i32) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _table: &mut VirtualTable<Self::Table>, _savepoint: i32) -> Result<()> {
        Ok(())
    }

    fn rollback_to(
        &mut self,
        _table: &mut VirtualTable<Self::Table>,
        _savepoint: i32,
    ) -> Result<()> {
        Ok(())
    }

    /// Supply an overload for `name/n_args` applied to this table's columns.
    fn find_function(
        &mut self,
        _table: &mut VirtualTable<Self::Table>,
        _n_args: i32,
        _name: &str,
    ) -> Option<VTabFunction<P>> {
        None
    }

    /// `ALTER TABLE ... RENAME TO`.
    fn rename(&mut self, table: &mut VirtualTable<Self::Table>, new_name: &str) -> Result<()> {
        if table.rename(new_name) {
            Ok(())
        } else {
            Err(Error::with_message(
                ErrorCode::Error,
                format!("virtual table cannot be renamed to \"{new_name}\""),
            ))
        }
    }
}
