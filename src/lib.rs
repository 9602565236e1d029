//! Run plugins as child processes and call typed functions in them over
//! loopback HTTP.
//!
//! The [`plugin`] module is linked into plugin executables; the [`client`]
//! module launches them from the host.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod schema;

pub use client::{Client, Connection, FunctionStub, HealthSignal};
pub use config::ClientConfig;
pub use error::{FunctionExecutionError, PluginError};
pub use plugin::{CallContext, FunctionEndpoint, PluginServer};
pub use schema::{SchemaDocument, Schemas, Validator};
