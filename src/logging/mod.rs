//! Structured logging setup
//!
//! Installs a global `tracing` subscriber:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else logging.level)
//!   └── Fmt Layer (plain text or JSON)
//! ```
//!
//! The library never installs a subscriber on its own; applications call
//! [`init`] once at startup.
//!
//! # Example
//!
//! ```no_run
//! use kumofs::config::LoggingConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! kumofs::logging::init(&LoggingConfig {
//!     level: "debug".to_string(),
//!     json: true,
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Logging initialization errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::InvalidFilter(config.level.clone(), e.to_string())),
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. A second call returns
/// [`LoggingError::AlreadyInitialized`].
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;

    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true);
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
    tracing::debug!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_builds_filter() {
        let config = LoggingConfig {
            level: "kumofs=debug,warn".to_string(),
            json: true,
        };
        assert!(env_filter(&config).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // The first call may lose to another test installing a subscriber
        let _ = init(&config);
        assert!(matches!(
            init(&config),
            Err(LoggingError::AlreadyInitialized(_))
        ));
    }
}
