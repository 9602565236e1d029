use super::endpoint::{EndpointReply, FunctionEndpoint};
use crate::error::ServerError;
use crate::protocol::{self, HEALTH_PATH, LOOPBACK_HOST, SCHEMAS_PATH};
use crate::schema::Schemas;
use bytes::Bytes;
use nix::errno::Errno;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use warp::http::{Method, StatusCode};
use warp::{Filter, Rejection, Reply};

const MAX_FUNCTION_NAME_LEN: usize = 128;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// The pending connection died before it was accepted
    Retry,
    /// Descriptor or memory exhaustion, may clear once requests finish
    Backoff,
    /// The listener itself is broken
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => return AcceptFailure::Retry,
        _ => {}
    }

    match e.raw_os_error().map(Errno::from_raw) {
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM) => {
            AcceptFailure::Backoff
        }
        Some(Errno::EPROTO | Errno::EPERM) => AcceptFailure::Retry,
        _ => AcceptFailure::Fatal,
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidFunctionName {
    #[error("function name cannot be empty")]
    Empty,

    #[error("function name cannot start with '/'")]
    LeadingSlash,

    #[error("function name cannot be longer than {MAX_FUNCTION_NAME_LEN} characters")]
    TooLong,

    #[error("function name contains invalid character: {0:?}")]
    InvalidCharacter(char),

    #[error("function name {0:?} is reserved")]
    Reserved(String),
}

/// Function names become path segments, so only URL-safe characters are
/// accepted and the built-in route names are reserved.
pub fn validate_function_name(name: &str) -> Result<(), InvalidFunctionName> {
    if name.is_empty() {
        return Err(InvalidFunctionName::Empty);
    }
    if name.starts_with('/') {
        return Err(InvalidFunctionName::LeadingSlash);
    }
    if name.len() > MAX_FUNCTION_NAME_LEN {
        return Err(InvalidFunctionName::TooLong);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(InvalidFunctionName::InvalidCharacter(c));
    }
    if name == HEALTH_PATH || name == SCHEMAS_PATH {
        return Err(InvalidFunctionName::Reserved(name.to_string()));
    }
    Ok(())
}

/// Snapshot of the registered functions, frozen when serving starts.
struct FunctionTable {
    endpoints: HashMap<String, FunctionEndpoint>,
    schemas: Schemas,
}

/// Serves registered functions over HTTP on an ephemeral loopback port.
///
/// Register everything first, then call [`PluginServer::start`]. The port is
/// announced on stdout before anything else happens, so plugin logging must
/// go to stderr (see [`crate::logging::init_for_plugin`]).
#[derive(Debug, Default)]
pub struct PluginServer {
    functions: HashMap<String, FunctionEndpoint>,
    shutdown: CancellationToken,
}

impl PluginServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `name`.
    ///
    /// Invalid names are logged and skipped. Registering an existing name
    /// replaces the previous endpoint.
    pub fn register_function(&mut self, name: &str, endpoint: FunctionEndpoint) {
        if let Err(e) = validate_function_name(name) {
            tracing::error!(function = name, error = %e, "Invalid function name");
            return;
        }

        if self.functions.insert(name.to_string(), endpoint).is_some() {
            tracing::warn!(function = name, "Function re-registered, replacing previous endpoint");
        } else {
            tracing::debug!(function = name, "Registered function");
        }
    }

    pub fn schemas(&self) -> Schemas {
        self.functions
            .iter()
            .map(|(name, endpoint)| (name.clone(), endpoint.schema().clone()))
            .collect()
    }

    /// Bind, announce the port on stdout, then serve until [`PluginServer::stop`]
    /// is called or the listener fails.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind((LOOPBACK_HOST, 0))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to bind to port");
                ServerError::Bind(e)
            })?;
        let port = listener.local_addr().map_err(ServerError::Bind)?.port();

        protocol::write_handshake(&mut io::stdout().lock(), port).map_err(ServerError::Handshake)?;

        tracing::info!(port, functions = self.functions.len(), "Plugin server listening");

        let failure = Arc::new(Mutex::new(None));
        let incoming = futures::stream::unfold(
            (TcpListenerStream::new(listener), failure.clone()),
            |(mut listener, failure)| async move {
                while let Some(accepted) = listener.next().await {
                    let e = match accepted {
                        Ok(stream) => return Some((Ok::<_, io::Error>(stream), (listener, failure))),
                        Err(e) => e,
                    };

                    match classify_accept_error(&e) {
                        AcceptFailure::Retry => {
                            tracing::warn!(error = %e, "Dropped failed connection");
                        }
                        AcceptFailure::Backoff => {
                            tracing::warn!(error = %e, "Out of resources accepting connection, backing off");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        AcceptFailure::Fatal => {
                            if let Ok(mut slot) = failure.lock() {
                                *slot = Some(e);
                            }
                            return None;
                        }
                    }
                }
                None
            },
        );

        let shutdown = self.shutdown.clone();
        warp::serve(self.routes())
            .serve_incoming_with_graceful_shutdown(Box::pin(incoming), async move {
                shutdown.cancelled().await
            })
            .await;

        let failure = failure.lock().ok().and_then(|mut slot| slot.take());
        match failure {
            Some(e) => {
                tracing::error!(error = %e, "Listener failed");
                Err(ServerError::Accept(e))
            }
            None => {
                tracing::info!("Plugin server stopped");
                Ok(())
            }
        }
    }

    /// Gracefully stop serving. Safe to call repeatedly, or before `start`.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Stopping plugin server");
            self.shutdown.cancel();
        }
    }

    pub(crate) fn routes(
        &self,
    ) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let table = Arc::new(FunctionTable {
            endpoints: self.functions.clone(),
            schemas: self.schemas(),
        });

        // Liveness/readiness probe
        let health = warp::path(HEALTH_PATH)
            .and(warp::path::end())
            .map(|| "ok");

        let all_schemas = warp::path(SCHEMAS_PATH)
            .and(warp::path::end())
            .and(with_table(table.clone()))
            .map(|table: Arc<FunctionTable>| warp::reply::json(&table.schemas));

        let function_schema = warp::path::param::<String>()
            .and(warp::path(SCHEMAS_PATH))
            .and(warp::path::end())
            .and(with_table(table.clone()))
            .map(|name: String, table: Arc<FunctionTable>| {
                match table.endpoints.get(&name) {
                    Some(endpoint) => warp::reply::json(endpoint.schema()).into_response(),
                    None => function_not_found(&name).into_response(),
                }
            });

        let invoke = warp::path::param::<String>()
            .and(warp::path::end())
            .and(warp::method())
            .and(warp::body::bytes())
            .and(with_table(table))
            .and_then(invoke_function);

        health.or(all_schemas).or(function_schema).or(invoke)
    }
}

fn with_table(
    table: Arc<FunctionTable>,
) -> impl Filter<Extract = (Arc<FunctionTable>,), Error = Infallible> + Clone {
    warp::any().map(move || table.clone())
}

fn function_not_found(name: &str) -> EndpointReply {
    EndpointReply::text(StatusCode::NOT_FOUND, format!("function {name:?} not found"))
}

async fn invoke_function(
    name: String,
    method: Method,
    body: Bytes,
    table: Arc<FunctionTable>,
) -> Result<EndpointReply, Rejection> {
    let Some(endpoint) = table.endpoints.get(&name) else {
        tracing::warn!(function = %name, "Call to unknown function");
        return Ok(function_not_found(&name));
    };

    let span = tracing::debug_span!("function_call", function = %name, body_bytes = body.len());
    let reply = endpoint.dispatch(&method, body).instrument(span.clone()).await;
    span.in_scope(|| tracing::debug!(status = reply.status.as_u16(), "Function call finished"));

    Ok(reply)
}
