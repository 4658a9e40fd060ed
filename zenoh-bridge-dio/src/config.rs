//! Configuration for the digital-I/O bridge.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use zendio_common::config::LoggingConfig;
use zendio_common::session::ZenohConfig;
use zendio_common::topics;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DioBridgeConfig {
    /// Zenoh connection settings
    pub zenoh: ZenohConfig,

    /// Serial line settings for the Modbus RTU bus
    pub serial: SerialConfig,

    /// Polling cadence and engine limits
    #[serde(default)]
    pub polling: PollingConfig,

    /// Topic prefix (default: "zendio/modbus")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Per-publish timeout in milliseconds
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Monitored discrete inputs
    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    /// Controlled relay outputs
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_topic_prefix() -> String {
    topics::DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_publish_timeout_ms() -> u64 {
    500
}

/// Modbus RTU serial line configuration.
///
/// Retry and timeout behavior lives here because the fieldbus port owns it;
/// the engine treats every read/write as a single bounded call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Response timeout per request in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Delay between retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Attempts per read/write before the call counts as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    300
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_max_retries() -> u32 {
    3
}

/// Polling cadence and engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Target cycle period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum age of a retained input state before it is re-published
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Upper bound on relay writes per cycle
    #[serde(default = "default_max_commands_per_cycle")]
    pub max_commands_per_cycle: usize,

    /// Heartbeat age that trips the watchdog
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,

    /// Interval between statistics log lines
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    400
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_max_commands_per_cycle() -> usize {
    10
}

fn default_watchdog_timeout_secs() -> u64 {
    10
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            max_commands_per_cycle: default_max_commands_per_cycle(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

/// A monitored discrete input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Modbus slave ID (1-247)
    pub slave_id: u8,

    /// Position within the slave's 8-bit discrete input block (0-7)
    pub address: u8,

    /// Input name, unique across all inputs (used in the default topic)
    pub name: String,

    /// Override for the state topic
    #[serde(default)]
    pub state_topic: Option<String>,
}

impl InputConfig {
    /// Resolve the state topic, falling back to the naming convention.
    pub fn resolved_state_topic(&self, prefix: &str) -> String {
        self.state_topic
            .clone()
            .unwrap_or_else(|| topics::input_state_topic(prefix, &self.name))
    }
}

/// A controlled relay output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Modbus slave ID (1-247)
    pub slave_id: u8,

    /// Coil address on the slave
    pub address: u16,

    /// Relay name, unique across all relays (routes inbound commands)
    pub name: String,

    /// Override for the command topic
    #[serde(default)]
    pub command_topic: Option<String>,

    /// Override for the confirmation topic
    #[serde(default)]
    pub state_topic: Option<String>,
}

impl RelayConfig {
    /// Resolve the command topic, falling back to the naming convention.
    pub fn resolved_command_topic(&self, prefix: &str) -> String {
        self.command_topic
            .clone()
            .unwrap_or_else(|| topics::relay_command_topic(prefix, &self.name))
    }

    /// Resolve the confirmation topic, falling back to the naming convention.
    pub fn resolved_state_topic(&self, prefix: &str) -> String {
        self.state_topic
            .clone()
            .unwrap_or_else(|| topics::relay_state_topic(prefix, &self.name))
    }
}

impl DioBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DioBridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() && self.relays.is_empty() {
            return Err(ConfigError::Validation(
                "At least one input or relay must be configured".to_string(),
            ));
        }

        match self.serial.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "Invalid parity '{}' (use none, even, or odd)",
                    other
                )));
            }
        }

        let mut input_names = HashSet::new();
        for input in &self.inputs {
            if input.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Input name cannot be empty".to_string(),
                ));
            }

            // Duplicate names would make two inputs share a topic.
            if !input_names.insert(input.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate input name '{}'",
                    input.name
                )));
            }

            if input.slave_id == 0 || input.slave_id > 247 {
                return Err(ConfigError::Validation(format!(
                    "Input '{}': slave_id must be 1-247",
                    input.name
                )));
            }

            if input.address > 7 {
                return Err(ConfigError::Validation(format!(
                    "Input '{}': address must be 0-7 (one 8-bit block per slave)",
                    input.name
                )));
            }
        }

        let mut relay_names = HashSet::new();
        for relay in &self.relays {
            if relay.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Relay name cannot be empty".to_string(),
                ));
            }

            // Duplicate names would make command routing ambiguous.
            if !relay_names.insert(relay.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate relay name '{}'",
                    relay.name
                )));
            }

            if relay.slave_id == 0 || relay.slave_id > 247 {
                return Err(ConfigError::Validation(format!(
                    "Relay '{}': slave_id must be 1-247",
                    relay.name
                )));
            }
        }

        Ok(())
    }
}
