//! Modbus RTU fieldbus access.
//!
//! [`ModbusRtu`] owns the serial line, the per-call retry budget, and the
//! running success/error counters. Callers see each read or write as a
//! single bounded operation that either succeeds or fails; retries and
//! timeouts never leak past this module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{error, info, warn};

use crate::config::SerialConfig;

/// Size of the discrete input block read from each slave.
pub const DISCRETE_BLOCK_LEN: usize = 8;

/// Minimum spacing between read-failure log lines, to avoid log spam while
/// a slave stays unreachable.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot of the fieldbus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldbusStats {
    pub read_success: u64,
    pub read_errors: u64,
    pub write_success: u64,
    pub write_errors: u64,
}

/// Access to a register-addressed fieldbus.
///
/// The engine is generic over this trait; tests drive it with in-memory
/// implementations.
#[async_trait]
pub trait FieldbusPort {
    /// Open the underlying transport. Returns `false` if the port cannot
    /// be opened.
    async fn connect(&mut self) -> bool;

    /// Close the underlying transport.
    async fn disconnect(&mut self);

    /// Whether the transport is currently open.
    fn is_connected(&self) -> bool;

    /// Read one 8-bit discrete input block from a slave.
    ///
    /// `None` means the call failed after the port's retry budget; the
    /// failure has already been counted and (rate-limited) logged.
    async fn read_discrete_block(
        &mut self,
        slave_id: u8,
        start_addr: u16,
    ) -> Option<[bool; DISCRETE_BLOCK_LEN]>;

    /// Write a single coil on a slave. Returns `true` on confirmed success.
    async fn write_single_bit(&mut self, slave_id: u8, address: u16, value: bool) -> bool;

    /// Snapshot the running counters.
    fn stats(&self) -> FieldbusStats;

    /// Reset the running counters to zero.
    fn reset_stats(&self);
}

/// Modbus RTU implementation of [`FieldbusPort`] over a serial line.
pub struct ModbusRtu {
    config: SerialConfig,
    ctx: Option<Context>,
    read_success: AtomicU64,
    read_errors: AtomicU64,
    write_success: AtomicU64,
    write_errors: AtomicU64,
    last_read_error_log: Option<Instant>,
}

impl ModbusRtu {
    /// Create an unconnected port for the given serial settings.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            ctx: None,
            read_success: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_success: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            last_read_error_log: None,
        }
    }

    fn open_serial(&self) -> Result<tokio_serial::SerialStream, tokio_serial::Error> {
        let parity = match self.config.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let stop_bits = match self.config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match self.config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        tokio_serial::SerialStream::open(&builder)
    }
}

#[async_trait]
impl FieldbusPort for ModbusRtu {
    async fn connect(&mut self) -> bool {
        if self.ctx.is_some() {
            return true;
        }

        let serial = match self.open_serial() {
            Ok(serial) => serial,
            Err(e) => {
                error!(port = %self.config.port, error = %e, "Failed to open serial port");
                return false;
            }
        };

        self.ctx = Some(rtu::attach_slave(serial, Slave(1)));

        info!(
            port = %self.config.port,
            baud = self.config.baud_rate,
            response_timeout_ms = self.config.response_timeout_ms,
            retries = self.config.max_retries,
            "Modbus RTU connected"
        );

        true
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                warn!(error = %e, "Error closing Modbus connection");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_discrete_block(
        &mut self,
        slave_id: u8,
        start_addr: u16,
    ) -> Option<[bool; DISCRETE_BLOCK_LEN]> {
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        let Some(ctx) = self.ctx.as_mut() else {
            return None;
        };
        ctx.set_slave(Slave(slave_id));

        let mut last_error = String::new();
        for attempt in 0..self.config.max_retries {
            let request = ctx.read_discrete_inputs(start_addr, DISCRETE_BLOCK_LEN as u16);
            match tokio::time::timeout(timeout, request).await {
                Ok(Ok(Ok(bits))) => {
                    self.read_success.fetch_add(1, Ordering::Relaxed);
                    let mut block = [false; DISCRETE_BLOCK_LEN];
                    for (slot, bit) in block.iter_mut().zip(bits) {
                        *slot = bit;
                    }
                    return Some(block);
                }
                Ok(Ok(Err(exception))) => last_error = format!("Exception: {:?}", exception),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "Response timeout".to_string(),
            }

            if attempt + 1 < self.config.max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }

        self.read_errors.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        if self
            .last_read_error_log
            .is_none_or(|t| now.duration_since(t) >= ERROR_LOG_INTERVAL)
        {
            error!(
                slave_id,
                start_addr,
                retries = self.config.max_retries,
                error = %last_error,
                "Modbus read failed"
            );
            self.last_read_error_log = Some(now);
        }

        None
    }

    async fn write_single_bit(&mut self, slave_id: u8, address: u16, value: bool) -> bool {
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        let Some(ctx) = self.ctx.as_mut() else {
            return false;
        };
        ctx.set_slave(Slave(slave_id));

        let mut last_error = String::new();
        for attempt in 0..self.config.max_retries {
            let request = ctx.write_single_coil(address, value);
            match tokio::time::timeout(timeout, request).await {
                Ok(Ok(Ok(()))) => {
                    self.write_success.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Ok(Ok(Err(exception))) => last_error = format!("Exception: {:?}", exception),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "Response timeout".to_string(),
            }

            if attempt + 1 < self.config.max_retries {
                warn!(
                    slave_id,
                    address,
                    attempt = attempt + 1,
                    max = self.config.max_retries,
                    error = %last_error,
                    "Modbus write retry"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }

        self.write_errors.fetch_add(1, Ordering::Relaxed);
        error!(
            slave_id,
            address,
            retries = self.config.max_retries,
            error = %last_error,
            "Modbus write failed"
        );

        false
    }

    fn stats(&self) -> FieldbusStats {
        FieldbusStats {
            read_success: self.read_success.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_success: self.write_success.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }

    fn reset_stats(&self) {
        self.read_success.store(0, Ordering::Relaxed);
        self.read_errors.store(0, Ordering::Relaxed);
        self.write_success.store(0, Ordering::Relaxed);
        self.write_errors.store(0, Ordering::Relaxed);
    }
}
