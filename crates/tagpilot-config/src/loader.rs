//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::TagpilotConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<TagpilotConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), containers = config.client.containers.len(), "config loaded");
    Ok(config)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(content: &str) -> Result<TagpilotConfig, ConfigError> {
    let config: TagpilotConfig = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &TagpilotConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.client.containers.is_empty() {
        return Err(ConfigError::Invalid(
            "client.containers must list at least one container".to_string(),
        ));
    }

    for (index, container) in config.client.containers.iter().enumerate() {
        if container.id().trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "client.containers[{}].id must not be empty",
                index
            )));
        }
    }

    if config.client.data_layer_name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "client.data_layer_name must not be empty".to_string(),
        ));
    }

    if config.client.host.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "client.host must not be empty".to_string(),
        ));
    }

    if config.retry.load_timeout_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "retry.load_timeout_ms must be > 0 when set".to_string(),
        ));
    }

    if config.verification.enabled && config.verification.timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "verification.timeout_ms must be > 0".to_string(),
        ));
    }

    let wait = config.consent.max_wait_for_update_ms;
    if !wait.is_finite() || wait < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "consent.max_wait_for_update_ms must be a non-negative number, got {}",
            wait
        )));
    }

    if config.consent.dedupe_window == Some(0) {
        return Err(ConfigError::Invalid(
            "consent.dedupe_window must be > 0 when set".to_string(),
        ));
    }

    let level = config.observability.log_level.trim().to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "observability.log_level '{}' is not one of {:?}",
            config.observability.log_level, LOG_LEVELS
        )));
    }

    Ok(())
}
