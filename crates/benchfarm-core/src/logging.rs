/*!
 * Logging functionality for benchfarm.
 *
 * This module provides tracing setup and the spans used by the resolver
 * and dispatcher so that every log line can be attributed to a device or
 * a lifecycle phase.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_from_config(&LoggingConfig::default())
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "benchfarm_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let config = LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    };
    init_from_config(&config)
}

/// Initialize the logging system from a [`LoggingConfig`]
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    installed.map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span covering the acquisition or use of one device
///
/// # Arguments
///
/// * `name` - The inventory name of the device
/// * `role` - The contract the device fulfils
pub fn device_span(name: &str, role: &str) -> Span {
    tracing::info_span!("device", name = %name, role = %role)
}

/// Create a span covering one lifecycle phase of an environment run
///
/// # Arguments
///
/// * `phase` - The phase name
/// * `run_id` - The environment run identifier
pub fn phase_span(phase: &str, run_id: &str) -> Span {
    tracing::info_span!("phase", phase = %phase, run = %run_id)
}
