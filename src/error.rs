use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while launching, supervising or introspecting a plugin process.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The executable path does not exist or points at a directory
    #[error("plugin not found: {}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },

    /// Spawn, handshake, health or introspection failure
    #[error("plugin execution error: {reason}")]
    Execution { reason: String },

    #[error("plugin is already running")]
    AlreadyRunning,

    #[error("failed to kill plugin process: {0}")]
    Kill(#[source] io::Error),
}

impl PluginError {
    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        PluginError::Execution {
            reason: reason.into(),
        }
    }
}

/// Failure of a single remote function call. Local to that call: the
/// connection it was issued on stays usable.
#[derive(Error, Debug)]
#[error("error executing function {function:?}: {cause}")]
pub struct FunctionExecutionError {
    pub function: String,
    #[source]
    pub cause: CallFailure,
}

impl FunctionExecutionError {
    pub(crate) fn new(function: &str, cause: CallFailure) -> Self {
        Self {
            function: function.to_string(),
            cause,
        }
    }

    /// HTTP status returned by the plugin, when the failure was a non-200 reply.
    pub fn status(&self) -> Option<u16> {
        match &self.cause {
            CallFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CallFailure {
    #[error("connection to plugin is closed")]
    Closed,

    #[error("failed to encode input: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("plugin returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode output: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors surfaced by [`crate::plugin::PluginServer::start`].
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind loopback listener: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to announce port on stdout: {0}")]
    Handshake(#[source] io::Error),

    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("timeout waiting for plugin to become healthy after {elapsed_ms}ms: {last_error}")]
    Timeout { elapsed_ms: u64, last_error: String },

    #[error("health check cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("error generating schema: {0}")]
    Derive(#[source] serde_json::Error),

    #[error("failed to compile schema: {0}")]
    Compile(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;
