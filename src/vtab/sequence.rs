use crate::error::{Error, Result};
use crate::function::Context;
use crate::index::IndexNegotiation;
use crate::provider::Sqlite3Api;
use crate::value::{NativeValue, Value};

use super::module::{Module, VTabConnection};
use super::table::{VirtualTable, VirtualTableCursor};

const SCHEMA: &str = "CREATE TABLE x(value)";

/// Read-only module exposing a fixed list of values as a one-column table.
///
/// Each row's rowid is its 1-based position in the list.
#[derive(Clone, Debug, Default)]
pub struct SequenceModule {
    rows: Vec<Value>,
}

impl SequenceModule {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    fn current(&self, cursor: &VirtualTableCursor<()>) -> Result<&Value> {
        let position = usize::try_from(cursor.row_index() - 1).ok();
        position
            .and_then(|position| self.rows.get(position))
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "cursor row index {} is out of range",
                    cursor.row_index()
                ))
            })
    }
}

impl<P: Sqlite3Api> Module<P> for SequenceModule {
    type Table = ();
    type Cursor = ();

    fn create(&mut self, _conn: &VTabConnection<'_, P>, _args: &[String]) -> Result<(String, ())> {
        Ok((SCHEMA.to_owned(), ()))
    }

    fn best_index(
        &mut self,
        table: &mut VirtualTable<()>,
        index: &mut IndexNegotiation,
    ) -> Result<()> {
        index.outputs.estimated_cost = Some(self.rows.len() as f64);
        index.outputs.estimated_rows = Some(self.rows.len() as i64);
        table.best_index(index);
        Ok(())
    }

    fn open(&mut self, _table: &mut VirtualTable<()>) -> Result<()> {
        Ok(())
    }

    fn filter(
        &mut self,
        _table: &VirtualTable<()>,
        cursor: &mut VirtualTableCursor<()>,
        index_number: i32,
        index_string: Option<&str>,
        args: &mut [NativeValue<'_, P>],
    ) -> Result<()> {
        cursor.filter(index_number, index_string, args)?;
        cursor.reset_row_index();
        cursor.next_row_index();
        Ok(())
    }

    fn next(&mut self, _table: &VirtualTable<()>, cursor: &mut VirtualTableCursor<()>) -> Result<()> {
        cursor.next_row_index();
        Ok(())
    }

    fn eof(&mut self, _table: &VirtualTable<()>, cursor: &mut VirtualTableCursor<()>) -> Result<bool> {
        let row = cursor.row_index();
        Ok(row <= VirtualTableCursor::<()>::INVALID_ROW_INDEX || row > self.rows.len() as i64)
    }

    fn column(
        &mut self,
        _table: &VirtualTable<()>,
        cursor: &mut VirtualTableCursor<()>,
        ctx: &Context<'_, P>,
        column: i32,
    ) -> Result<()> {
        if column != 0 {
            return Err(Error::invalid_state(format!("column {column} is out of range")));
        }
        ctx.set_result(self.current(cursor)?.clone())
    }

    fn row_id(&mut self, _table: &VirtualTable<()>, cursor: &mut VirtualTableCursor<()>) -> Result<i64> {
        self.current(cursor)?;
        Ok(cursor.row_index())
    }
}
