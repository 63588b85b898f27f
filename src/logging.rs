//! Tracing subscriber setup driven by [`LoggingConfig`].

use crate::config::{LogLevel, LoggingConfig};
use crate::error::{AnvilError, AnvilResult};
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is not set.
fn default_directive(level: LogLevel) -> String {
    let level = tracing::Level::from(level);
    format!("{}", level).to_lowercase()
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a global subscriber
/// is already installed.
pub fn init_logging(config: &LoggingConfig) -> AnvilResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };

    result.map_err(|e| AnvilError::config(format!("Failed to initialize logging: {}", e)))
}
