// crates/workshop-cli/src/logging.rs
// ============================================================================
// Module: Logging
// Description: Tracing subscriber setup for the binary.
// Purpose: Route library spans and events to stderr in text or JSON form.
// Dependencies: tracing-subscriber, workshop-config
// ============================================================================

//! ## Overview
//! `RUST_LOG` wins when set; otherwise the configured filter (which
//! `WORKSHOP_LOG` overrides) applies. Output goes to stderr so command
//! output on stdout stays machine-readable.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workshop_config::LogFormat;
use workshop_config::LoggingConfig;

/// Subscriber setup failures.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// A global subscriber was already installed.
    #[error("logging already initialized: {0}")]
    Install(String),
}

/// Builds the effective filter.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when the configured directive is invalid.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(config.filter.trim()).map_err(|err| LoggingError::Filter(err.to_string()))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(build_filter(config)?);
    let installed = match config.format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_level(true)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init(),
    };
    installed.map_err(|err| LoggingError::Install(err.to_string()))
}
