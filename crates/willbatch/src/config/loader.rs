use std::path::Path;

use crate::config::schema::{EngineConfig, CONFIG_VERSION};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "batch_size must be at least 1".to_string(),
        });
    }

    if config.preview_limit == 0 {
        return Err(ConfigError::Validation {
            message: "preview_limit must be at least 1".to_string(),
        });
    }

    if config.monitor_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "monitor_interval_ms must be greater than 0".to_string(),
        });
    }

    if tracing_subscriber::EnvFilter::try_new(&config.logging.level).is_err() {
        return Err(ConfigError::Validation {
            message: format!("Invalid log level filter: {}", config.logging.level),
        });
    }

    Ok(())
}
