use core::ptr::NonNull;

use crate::error::Result;
use crate::provider::{OpenOptions, Sqlite3Api};

/// Safe wrapper around a `sqlite3*` connection.
pub struct Connection<'p, P: Sqlite3Api> {
    pub(crate) api: &'p P,
    pub(crate) db: NonNull<P::Db>,
}

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Open a connection using the provider SPI.
    pub fn open(api: &'p P, filename: &str, options: OpenOptions<'_>) -> Result<Self> {
        let db = unsafe { api.open(filename, options)? };
        tracing::debug!(backend = api.backend_name(), filename, "opened connection");
        Ok(Self { api, db })
    }

    /// Provider this connection was opened through.
    pub fn api(&self) -> &'p P {
        self.api
    }

    /// Expose the raw database handle.
    pub fn raw_handle(&self) -> NonNull<P::Db> {
        self.db
    }
}

impl<'p, P: Sqlite3Api> Drop for Connection<'p, P> {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.api.close(self.db) } {
            tracing::warn!(error = %err, "closing connection failed");
        }
    }
}
