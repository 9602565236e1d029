use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Host-side settings for launching and supervising one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Plugin executable
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the plugin process, on top of the host's own
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_function_execution_timeout")]
    pub function_execution_timeout_ms: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    /// 0 disables supervision
    #[serde(default)]
    pub supervision_interval_ms: u64,
}

fn default_function_execution_timeout() -> u64 {
    120_000
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_health_check_interval() -> u64 {
    150
}

impl ClientConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            function_execution_timeout_ms: default_function_execution_timeout(),
            health_check_timeout_ms: default_health_check_timeout(),
            health_check_interval_ms: default_health_check_interval(),
            supervision_interval_ms: 0,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_function_execution_timeout(mut self, timeout: Duration) -> Self {
        self.function_execution_timeout_ms = millis(timeout);
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout_ms = millis(timeout);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = millis(interval);
        self
    }

    pub fn with_supervision_interval(mut self, interval: Duration) -> Self {
        self.supervision_interval_ms = millis(interval);
        self
    }

    pub fn function_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.function_execution_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn supervision_interval(&self) -> Option<Duration> {
        (self.supervision_interval_ms > 0)
            .then(|| Duration::from_millis(self.supervision_interval_ms))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("/usr/local/bin/plugin");

        assert_eq!(config.function_execution_timeout(), Duration::from_secs(120));
        assert_eq!(config.health_check_timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check_interval(), Duration::from_millis(150));
        assert_eq!(config.supervision_interval(), None);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"path":"./plugin","supervision_interval_ms":200}"#).unwrap();

        let expected =
            ClientConfig::new("./plugin").with_supervision_interval(Duration::from_millis(200));
        assert_eq!(config, expected);
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new("plugin")
            .with_args(["--verbose"])
            .with_env("PLUGIN_MODE", "test")
            .with_health_check_timeout(Duration::from_millis(750));

        assert_eq!(config.args, vec!["--verbose".to_string()]);
        assert_eq!(config.env["PLUGIN_MODE"], "test");
        assert_eq!(config.health_check_timeout_ms, 750);
    }
}
