use super::Connection;
use crate::error::HealthError;
use crate::protocol::HEALTH_PATH;
use reqwest::StatusCode;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One-shot notification that a supervised plugin session has ended.
///
/// Fires once, either because supervision found the plugin unhealthy (after
/// the client has torn the session down) or because the client was closed.
/// Any number of clones may wait on it.
#[derive(Debug, Clone, Default)]
pub struct HealthSignal {
    token: CancellationToken,
}

impl HealthSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.token.cancel();
    }

    pub fn has_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }
}

/// Issues `/_healthz` probes against one plugin.
#[derive(Debug, Clone)]
pub(crate) struct HealthProbe {
    http: reqwest::Client,
    url: String,
}

impl HealthProbe {
    pub(crate) fn new(http: reqwest::Client, connection: &Connection) -> Self {
        Self {
            http,
            url: connection.url_for(HEALTH_PATH),
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<(), String> {
        let response = self
            .http
            .get(&self.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(format!("health endpoint returned status {}", status.as_u16())),
        }
    }

    /// Probe until the plugin answers 200 or `deadline` has elapsed,
    /// sleeping `poll_interval` between attempts.
    pub(crate) async fn wait_healthy(
        &self,
        deadline: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), HealthError> {
        let started = Instant::now();
        let mut last_error = String::from("no probe completed");

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            let attempt = tokio::select! {
                attempt = self.probe(remaining) => attempt,
                _ = cancel.cancelled() => return Err(HealthError::Cancelled),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::trace!(error = %e, "Health probe failed");
                    last_error = e;
                }
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
                _ = cancel.cancelled() => return Err(HealthError::Cancelled),
            }
        }

        Err(HealthError::Timeout {
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            last_error,
        })
    }
}

/// Why a supervision loop ended.
#[derive(Debug)]
pub(crate) enum SupervisionEnd {
    Cancelled,
    Unhealthy(HealthError),
}

/// Re-probe the plugin every `period`. Each tick gets one polling window as
/// long as the period itself; a single failed window ends supervision.
pub(crate) async fn supervise(
    probe: HealthProbe,
    period: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> SupervisionEnd {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SupervisionEnd::Cancelled,
            _ = ticker.tick() => {}
        }

        match probe.wait_healthy(period, poll_interval, &cancel).await {
            Ok(()) => tracing::trace!("Plugin passed health supervision"),
            Err(HealthError::Cancelled) => return SupervisionEnd::Cancelled,
            Err(e) => return SupervisionEnd::Unhealthy(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use url::Url;
    use warp::Filter;

    async fn serve_health(
        status: warp::http::StatusCode,
    ) -> (Arc<Connection>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let route = warp::path("_healthz").map(move || warp::reply::with_status("ok", status));
        let (addr, server) = warp::serve(route).bind_with_graceful_shutdown(
            ([127, 0, 0, 1], 0),
            {
                let shutdown = shutdown.clone();
                async move { shutdown.cancelled().await }
            },
        );
        tokio::spawn(server);

        let url = Url::parse(&format!("http://{addr}")).unwrap();
        (
            Arc::new(Connection::new(url, Duration::from_secs(1))),
            shutdown,
        )
    }

    #[tokio::test]
    async fn test_wait_healthy_succeeds_on_ok() {
        let (connection, shutdown) = serve_health(warp::http::StatusCode::OK).await;
        let probe = HealthProbe::new(reqwest::Client::new(), &connection);

        probe
            .wait_healthy(
                Duration::from_secs(2),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wait_healthy_times_out_on_non_200() {
        let (connection, shutdown) =
            serve_health(warp::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let probe = HealthProbe::new(reqwest::Client::new(), &connection);

        let started = Instant::now();
        let err = probe
            .wait_healthy(
                Duration::from_millis(300),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Timeout { .. }));
        assert!(err.to_string().contains("503"));
        assert!(started.elapsed() < Duration::from_secs(2));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wait_healthy_observes_cancellation() {
        let connection = Connection::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            Duration::from_secs(1),
        );
        let probe = HealthProbe::new(reqwest::Client::new(), &connection);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = probe
            .wait_healthy(Duration::from_secs(5), Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::Cancelled));
    }

    #[tokio::test]
    async fn test_supervise_ends_when_plugin_goes_away() {
        let (connection, shutdown) = serve_health(warp::http::StatusCode::OK).await;
        let probe = HealthProbe::new(reqwest::Client::new(), &connection);
        let supervisor = tokio::spawn(supervise(
            probe,
            Duration::from_millis(100),
            Duration::from_millis(20),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!supervisor.is_finished());

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(3), supervisor)
            .await
            .expect("supervision must notice the outage")
            .unwrap();
        assert!(matches!(end, SupervisionEnd::Unhealthy(_)));
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancel() {
        let (connection, shutdown) = serve_health(warp::http::StatusCode::OK).await;
        let probe = HealthProbe::new(reqwest::Client::new(), &connection);
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            probe,
            Duration::from_millis(50),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, SupervisionEnd::Cancelled));

        shutdown.cancel();
    }

    #[test]
    fn test_health_signal_fires_once_for_all_clones() {
        let signal = HealthSignal::new();
        let waiter = signal.clone();
        assert!(!waiter.has_fired());

        signal.fire();
        signal.fire();
        assert!(waiter.has_fired());
    }
}
