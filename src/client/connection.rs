use crate::protocol;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Address and call timeout of a reachable plugin.
///
/// Immutable once built. The owning [`super::Client`] marks it closed on
/// teardown, after which stubs refuse to use it.
#[derive(Debug)]
pub struct Connection {
    base_url: Url,
    call_timeout: Duration,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(base_url: Url, call_timeout: Duration) -> Self {
        Self {
            base_url,
            call_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn loopback(port: u16, call_timeout: Duration) -> Result<Self, url::ParseError> {
        Ok(Self::new(protocol::loopback_url(port)?, call_timeout))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Absolute URL of `path` below the base address.
    pub(crate) fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_joins_paths() {
        let connection = Connection::loopback(8080, Duration::from_secs(1)).unwrap();

        assert_eq!(connection.url_for("hello"), "http://127.0.0.1:8080/hello");
        assert_eq!(
            connection.url_for("hello/_schemas"),
            "http://127.0.0.1:8080/hello/_schemas"
        );
    }

    #[test]
    fn test_mark_closed() {
        let connection = Connection::loopback(8080, Duration::from_secs(1)).unwrap();
        assert!(!connection.is_closed());

        connection.mark_closed();
        connection.mark_closed();
        assert!(connection.is_closed());
    }
}
