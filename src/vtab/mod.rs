//! Virtual table modules: the [`Module`] trait, the dispatch host that adapts
//! it to `sqlite3_module`, and connection-level registration.

mod host;
mod module;
mod native;
mod sequence;
mod table;

use core::ffi::c_void;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::function::drop_boxed;
use crate::provider::{FeatureSet, Sqlite3Api};

pub use self::host::{ModuleHost, ModuleOptions};
pub use self::module::{Module, VTabConnection};
pub use self::native::{
    ForwardingModule, MAX_MODULE_VERSION, NativeModule, native_module_table,
};
pub use self::sequence::SequenceModule;
pub use self::table::{NativeHandle, VirtualTable, VirtualTableCursor};

impl<'p, P: Sqlite3Api> Connection<'p, P> {
    /// Register `module` under `name` with default [`ModuleOptions`].
    pub fn create_module<M: Module<P>>(&self, name: &str, module: M) -> Result<()> {
        self.create_module_with_options(name, module, ModuleOptions::default())
    }

    /// Register `module` under `name`.
    pub fn create_module_with_options<M: Module<P>>(
        &self,
        name: &str,
        module: M,
        options: ModuleOptions,
    ) -> Result<()> {
        let host = ModuleHost::new(self.api, name, module, options);
        self.create_native_module(name, host, options.module_version)
    }

    /// Register a raw callback implementation under `name`.
    ///
    /// The engine owns `module` from here on and drops it when the module is
    /// replaced or the connection closes. `version` must be 1 or
    /// [`MAX_MODULE_VERSION`].
    pub fn create_native_module<N: NativeModule<P> + 'static>(
        &self,
        name: &str,
        module: N,
        version: i32,
    ) -> Result<()> {
        if !self.api.feature_set().contains(FeatureSet::VIRTUAL_TABLES) {
            return Err(Error::feature_unavailable("virtual tables unsupported"));
        }
        if !(1..=MAX_MODULE_VERSION).contains(&version) {
            return Err(Error::invalid_state(format!(
                "module version {version} is not supported"
            )));
        }
        let table = Box::leak(Box::new(native_module_table::<P, N>(version)));
        let user_data = Box::into_raw(Box::new(module)) as *mut c_void;
        tracing::debug!(module = name, version, backend = self.api.backend_name(), "registering module");
        unsafe {
            self.api.create_module_v2(
                self.db,
                name,
                table,
                user_data,
                Some(drop_boxed::<N>),
            )
        }
    }
}
