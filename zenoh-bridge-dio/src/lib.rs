//! Zenoh bridge for Modbus RTU digital I/O.
//!
//! The bridge polls discrete inputs (buttons, sensors) on a Modbus RTU bus
//! and publishes their state to Zenoh, and it subscribes to relay command
//! topics and writes the requested coil states back to the bus.
//!
//! # Topics
//!
//! ```text
//! <prefix>/input/<name>/state     retained "ON"/"OFF" input state
//! <prefix>/relay/<name>/set       inbound relay commands
//! <prefix>/relay/<name>/state     retained relay write confirmations
//! ```
//!
//! Where `<prefix>` defaults to `zendio/modbus` and `<name>` is the input or
//! relay name from the configuration.

pub mod bus;
pub mod config;
pub mod engine;
pub mod fieldbus;
pub mod watchdog;
