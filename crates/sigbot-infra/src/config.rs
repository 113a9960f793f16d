//! Configuration loader for sigbot.
//!
//! Reads `sigbot.toml` (or the path given on the command line), applies
//! environment overrides and validates the result. A missing file yields the
//! defaults; a file that exists but does not parse is an error.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sigbot_types::config::BotConfig;
use sigbot_types::error::ConfigError;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "sigbot.toml";

/// Environment variables that override file values.
pub const ENV_PHONE_NUMBER: &str = "SIGNAL_PHONE_NUMBER";
pub const ENV_SERVICE_URL: &str = "SIGNAL_SERVICE_URL";
pub const ENV_API_URL: &str = "SIGNAL_API_URL";
pub const ENV_SQLITE_DATABASE: &str = "SIGBOT_SQLITE_DATABASE";
pub const ENV_WORKER_POOL_SIZE: &str = "SIGBOT_WORKER_POOL_SIZE";
pub const ENV_QUEUE_SIZE: &str = "SIGBOT_QUEUE_SIZE";

/// `path`, or `sigbot.toml` in the working directory.
pub fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load, override from the process environment, and validate.
pub async fn load_config(path: Option<&Path>) -> Result<BotConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok()).await
}

/// Like [`load_config`] with an explicit environment lookup.
pub async fn load_config_with<F>(path: Option<&Path>, env: F) -> Result<BotConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_path = resolve_config_path(path);
    let mut config = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => parse_config(&content)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            BotConfig::default()
        }
        Err(err) => {
            return Err(ConfigError::Read {
                path: config_path.display().to_string(),
                message: err.to_string(),
            });
        }
    };

    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Parse TOML text into a configuration (no overrides, no validation).
pub fn parse_config(content: &str) -> Result<BotConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Apply the environment overrides. Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut BotConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

    if let Some(value) = lookup(ENV_PHONE_NUMBER) {
        config.account.phone_number = value;
    }
    if let Some(value) = lookup(ENV_SERVICE_URL) {
        config.account.service_url = value;
    }
    if let Some(value) = lookup(ENV_API_URL) {
        config.account.api_url = value;
    }
    if let Some(value) = lookup(ENV_SQLITE_DATABASE) {
        config.storage.sqlite_database = value;
    }
    if let Some(value) = lookup(ENV_WORKER_POOL_SIZE) {
        config.worker.pool_size = parse_number(ENV_WORKER_POOL_SIZE, &value)?;
    }
    if let Some(value) = lookup(ENV_QUEUE_SIZE) {
        config.worker.queue_size = parse_number(ENV_QUEUE_SIZE, &value)?;
    }
    Ok(())
}

fn parse_number<T: FromStr>(field: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field: field.to_string(),
        message: format!("{value:?}: {e}"),
    })
}
