//! Host side: launch a plugin executable and talk to it.
//!
//! # Lifecycle
//!
//! - **open**: check the executable, spawn it, read the port it announces on
//!   its first stdout line, then poll `/_healthz` until it answers
//! - **supervise** (optional): re-probe health on a fixed interval and tear
//!   the session down on the first failed window
//! - **close**: kill and reap the process, invalidate the connection and fire
//!   the health signal
//!
//! Every teardown path (explicit close, failed open, cancellation of the token
//! passed to `open`, supervision failure) runs the same routine, and only the
//! first one for a given session has any effect.

use crate::config::ClientConfig;
use crate::error::{PluginError, Result};
use crate::protocol::SCHEMAS_PATH;
use crate::schema::Schemas;
use arc_swap::ArcSwapOption;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod function;
pub mod health;
mod process;

pub use connection::Connection;
pub use function::FunctionStub;
pub use health::HealthSignal;

use health::{HealthProbe, SupervisionEnd};

/// A running plugin process and everything derived from it.
struct Session {
    generation: u64,
    child: Child,
    pid: Option<u32>,
    http: reqwest::Client,
    cancel: CancellationToken,
    health: Option<HealthSignal>,
}

impl Session {
    async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let killed = process::terminate(&mut self.child).await;
        tracing::info!(pid = self.pid, "Plugin closed");

        if let Some(signal) = &self.health {
            signal.fire();
        }

        killed.map_err(PluginError::Kill)
    }
}

#[derive(Default)]
struct Shared {
    session: Mutex<Option<Session>>,
    connection: ArcSwapOption<Connection>,
    generation: AtomicU64,
    opening: tokio::sync::Mutex<()>,
    /// Held for a whole teardown so concurrent callers return only once the
    /// process is reaped
    closing: tokio::sync::Mutex<()>,
    /// Cancellation of the `open` currently in flight, if any
    pending: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_pending(&self, cancel: Option<CancellationToken>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = cancel;
    }

    fn cancel_pending(&self) {
        if let Some(cancel) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() {
            cancel.cancel();
        }
    }

    /// Tear down the current session. With a generation, only that session
    /// is affected, so stale background tasks never touch a newer one.
    async fn teardown(&self, generation: Option<u64>) -> Result<()> {
        let _closing = self.closing.lock().await;
        let session = {
            let mut slot = self.lock_session();
            let matches = match (slot.as_ref(), generation) {
                (Some(session), Some(generation)) => session.generation == generation,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return Ok(());
            }
            if let Some(connection) = self.connection.swap(None) {
                connection.mark_closed();
            }
            slot.take()
        };

        match session {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Owns one plugin process and the connection to it.
pub struct Client {
    config: ClientConfig,
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Launch the plugin and wait until it reports healthy.
    ///
    /// Cancelling `cancellation` later tears the session down and kills the
    /// process. On error nothing is left running, including when [`Client::close`]
    /// is called before startup finishes.
    pub async fn open(&self, cancellation: CancellationToken) -> Result<()> {
        let _opening = self.shared.opening.lock().await;

        let running = self.shared.lock_session().is_some();
        if running {
            return Err(PluginError::AlreadyRunning);
        }

        let path = &self.config.path;
        process::check_executable(path)?;

        let cancel = cancellation.child_token();
        self.shared.set_pending(Some(cancel.clone()));
        let (child, pid, connection, http) = match self.launch(&cancel).await {
            Ok(launched) => launched,
            Err(e) => {
                self.shared.set_pending(None);
                return Err(e);
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let supervision = self.config.supervision_interval();
        let health = supervision.map(|_| HealthSignal::new());

        // A close that raced this open has already cancelled the token
        let rejected = {
            let mut slot = self.shared.lock_session();
            if cancel.is_cancelled() {
                Some(child)
            } else {
                self.shared.connection.store(Some(connection.clone()));
                *slot = Some(Session {
                    generation,
                    child,
                    pid,
                    http: http.clone(),
                    cancel: cancel.clone(),
                    health,
                });
                None
            }
        };
        self.shared.set_pending(None);
        if let Some(mut child) = rejected {
            connection.mark_closed();
            if let Err(e) = process::terminate(&mut child).await {
                tracing::warn!(pid, error = %e, "Failed to kill plugin after cancelled start");
            }
            return Err(PluginError::execution("plugin was closed while starting"));
        }

        let probe = HealthProbe::new(http, &connection);
        tokio::spawn(watch_session(
            Arc::downgrade(&self.shared),
            generation,
            cancel,
            probe,
            supervision,
            self.config.health_check_interval(),
        ));

        tracing::info!(
            pid,
            base_url = %connection.base_url(),
            supervision_ms = supervision.map(|d| d.as_millis() as u64),
            "Plugin is ready"
        );
        Ok(())
    }

    /// Spawn the plugin and connect to it, killing it again on failure.
    async fn launch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Child, Option<u32>, Arc<Connection>, reqwest::Client)> {
        let path = &self.config.path;
        let mut child = process::spawn(path, &self.config.args, &self.config.env)?;
        let pid = child.id();
        tracing::info!(path = %path.display(), pid, "Started plugin process");

        match self.connect(&mut child, pid, cancel).await {
            Ok((connection, http)) => Ok((child, pid, connection, http)),
            Err(e) => {
                tracing::error!(pid, error = %e, "Plugin failed to start");
                cancel.cancel();
                if let Err(kill) = process::terminate(&mut child).await {
                    tracing::warn!(pid, error = %kill, "Failed to kill plugin after failed start");
                }
                Err(e)
            }
        }
    }

    /// Read the handshake, build the connection and wait for the first
    /// healthy probe.
    async fn connect(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Connection>, reqwest::Client)> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::execution("plugin stdout is not available"))?;
        let mut stdout = BufReader::new(stdout);

        let port =
            process::read_handshake(&mut stdout, self.config.health_check_timeout(), cancel)
                .await?;
        process::forward_stdout(stdout, pid);
        tracing::debug!(pid, port, "Plugin announced port");

        let connection = Connection::loopback(port, self.config.function_execution_timeout())
            .map_err(|e| PluginError::execution(format!("invalid plugin address: {e}")))?;
        let connection = Arc::new(connection);

        // Loopback only, bypass any HTTP_PROXY
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(self.config.function_execution_timeout())
            .build()
            .map_err(|e| PluginError::execution(format!("failed to build HTTP client: {e}")))?;

        HealthProbe::new(http.clone(), &connection)
            .wait_healthy(
                self.config.health_check_timeout(),
                self.config.health_check_interval(),
                cancel,
            )
            .await
            .map_err(|e| PluginError::execution(e.to_string()))?;

        Ok((connection, http))
    }

    /// List every function the plugin exposes with its schemas.
    pub async fn schemas(&self) -> Result<Schemas> {
        let http = self.shared.lock_session().as_ref().map(|s| s.http.clone());
        let (Some(http), Some(connection)) = (http, self.connection()) else {
            return Err(PluginError::execution("plugin is not connected"));
        };

        let response = http
            .get(connection.url_for(SCHEMAS_PATH))
            .send()
            .await
            .map_err(|e| PluginError::execution(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(PluginError::execution(format!(
                "plugin returned status {}",
                response.status().as_u16()
            )));
        }

        response
            .json::<Schemas>()
            .await
            .map_err(|e| PluginError::execution(e.to_string()))
    }

    /// The live connection, if the plugin is open.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.connection.load_full()
    }

    /// Signal that fires once the supervised session ends. `None` when
    /// supervision is disabled or the client is not open.
    pub fn health_signal(&self) -> Option<HealthSignal> {
        self.shared
            .lock_session()
            .as_ref()
            .and_then(|session| session.health.clone())
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock_session().as_ref().and_then(|session| session.pid)
    }

    /// Kill the plugin and release the connection. Safe to call when never
    /// opened or already closed. An `open` still in progress is cancelled and
    /// fails.
    pub async fn close(&self) -> Result<()> {
        self.shared.cancel_pending();
        self.shared.teardown(None).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = self.shared.lock_session().as_ref() {
            session.cancel.cancel();
        }
    }
}

/// Background task owning a session's lifetime: it supervises health when
/// configured and tears the session down once it ends for any reason.
async fn watch_session(
    shared: Weak<Shared>,
    generation: u64,
    cancel: CancellationToken,
    probe: HealthProbe,
    supervision: Option<Duration>,
    poll_interval: Duration,
) {
    let end = match supervision {
        Some(period) => health::supervise(probe, period, poll_interval, cancel).await,
        None => {
            cancel.cancelled().await;
            SupervisionEnd::Cancelled
        }
    };

    if let SupervisionEnd::Unhealthy(e) = &end {
        tracing::warn!(generation, error = %e, "Plugin failed health supervision, closing");
    }

    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Err(e) = shared.teardown(Some(generation)).await {
        tracing::warn!(generation, error = %e, "Failed to tear down plugin session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let client = Client::new(ClientConfig::new(PathBuf::from("/nonexistent")));

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.connection().is_none());
        assert!(client.health_signal().is_none());
        assert!(client.pid().is_none());
    }

    #[tokio::test]
    async fn test_schemas_requires_connection() {
        let client = Client::new(ClientConfig::new(PathBuf::from("/nonexistent")));

        let err = client.schemas().await.unwrap_err();
        assert!(matches!(err, PluginError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_open_missing_plugin_is_not_found() {
        let client = Client::new(ClientConfig::new(PathBuf::from("/nonexistent/plugin")));

        let err = client.open(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound { .. }));
        assert!(client.connection().is_none());
    }
}
