use super::schema::ClientConfig;
use crate::error::ConfigError;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use std::path::Path;

const ENV_PREFIX: &str = "PROCPLUG_";

/// Layer the config file (or the default `procplug.*` files when none is
/// given) under `PROCPLUG_*` environment variables.
pub fn figment(file: Option<&Path>) -> Result<Figment, ConfigError> {
    let figment = match file {
        Some(path) => match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Figment::new().merge(Toml::file(path)),
            Some("json") => Figment::new().merge(Json::file(path)),
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            _ => {
                return Err(ConfigError::Parse(
                    "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
                ))
            }
        },
        None => Figment::new()
            .merge(Toml::file("procplug.toml"))
            .merge(Json::file("procplug.json"))
            .merge(Yaml::file("procplug.yaml"))
            .merge(Yaml::file("procplug.yml")),
    };

    Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
}

/// Extract and validate a [`ClientConfig`].
pub fn extract(figment: Figment) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    extract(figment(Some(path.as_ref()))?)
}

pub fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("Plugin path must not be empty".into()));
    }

    if config.function_execution_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "Function execution timeout must be greater than 0".into(),
        ));
    }

    if config.health_check_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "Health check timeout must be greater than 0".into(),
        ));
    }

    if config.health_check_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "Health check interval must be greater than 0".into(),
        ));
    }

    Ok(())
}
