//! Plugin side: expose typed functions over loopback HTTP.
//!
//! A plugin executable builds a [`PluginServer`], registers one
//! [`FunctionEndpoint`] per function and calls [`PluginServer::start`]:
//!
//! ```no_run
//! use procplug::plugin::{CallContext, FunctionEndpoint, PluginServer};
//! use procplug::schema::Validator;
//! use schemars::JsonSchema;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct In {
//!     #[schemars(length(min = 3))]
//!     name: String,
//! }
//!
//! #[derive(Serialize, JsonSchema)]
//! struct Out {
//!     greeting: String,
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut server = PluginServer::new();
//! server.register_function(
//!     "hello",
//!     FunctionEndpoint::new(
//!         |_context: CallContext, input: In| async move {
//!             Ok::<_, anyhow::Error>(Out { greeting: format!("hello, {}!", input.name) })
//!         },
//!         Some(Validator::new()?),
//!     ),
//! );
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod server;

pub use endpoint::{CallContext, FunctionEndpoint};
pub use server::{validate_function_name, InvalidFunctionName, PluginServer};
