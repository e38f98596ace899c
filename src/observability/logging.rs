//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber from a [`LogConfig`]. `RUST_LOG`, when
//! set, takes precedence over the configured level and directives.

use tracing::{warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{RegistryError, RegistryResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Parse a level name, falling back to `info` for unknown names
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the filter: `RUST_LOG` if present, otherwise the configured level plus directives
pub fn build_filter(config: &LogConfig) -> RegistryResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::default().add_directive(parse_level(&config.level).into());
    for directive in &config.directives {
        let parsed = directive.parse().map_err(|e| {
            RegistryError::config(format!("invalid log directive '{}': {}", directive, e))
        })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Install the global subscriber
///
/// A subscriber that is already installed (for example by a test harness) is kept.
pub fn init_logging(config: &LogConfig) -> RegistryResult<()> {
    let filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if installed.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(())
}
