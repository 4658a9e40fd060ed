//! zendio common library
//!
//! Shared building blocks for the zendio Modbus digital-I/O bridge:
//!
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`session`] - Zenoh connection configuration and session setup
//! - [`topics`] - Topic builders and parsers for the zendio namespace
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod session;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use session::{ZenohConfig, connect};
pub use topics::{
    DEFAULT_TOPIC_PREFIX, input_state_topic, parse_relay_command, parse_switch_payload,
    relay_command_topic, relay_command_wildcard, relay_state_topic, status_topic,
};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
