//! Logging setup on `tracing-subscriber`.
//!
//! `log::*` calls are bridged through `tracing_log::LogTracer`, so the
//! processor's `log` messages inherit the `job_run`/`batch` span context.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

/// Noisy dependencies kept at `warn` unless the level string overrides them.
const QUIET_TARGETS: &[&str] = &["rusqlite=warn", "tokio=warn"];

/// Builds the filter from `RUST_LOG` when set, else from the configured level.
pub fn build_env_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }

    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
    let filter = directives.join(",");
    EnvFilter::try_new(&filter)
        .map_err(|e| ConfigError::Logging(format!("invalid filter '{}': {}", filter, e)))
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    // Already installed when another subscriber bridged `log` first.
    tracing_log::LogTracer::init().ok();

    let filter = build_env_filter(&config.level)?;

    let result = match config.format {
        LogFormat::Plain => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };

    if let Err(e) = result {
        log::debug!("Logging already initialized: {}", e);
    }
    Ok(())
}
