//! Zenoh bridge for Modbus RTU digital I/O.
//!
//! Polls discrete inputs on a Modbus RTU bus, publishes their state to
//! Zenoh, and applies relay commands received from the bus back onto the
//! coils.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use zendio_common::config::LoggingConfig;
use zendio_common::topics;
use zenoh_bridge_dio::bus::{BusPort, ZenohBus};
use zenoh_bridge_dio::config::DioBridgeConfig;
use zenoh_bridge_dio::engine::DioEngine;
use zenoh_bridge_dio::fieldbus::{FieldbusPort, ModbusRtu};
use zenoh_bridge_dio::watchdog::WatchdogState;

/// Grace period between a watchdog trip and the hard process exit, giving
/// the run loop a chance to unwind on its own.
const WATCHDOG_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Zenoh bridge for Modbus RTU digital inputs and relay outputs.
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-dio")]
#[command(about = "Bridges Modbus RTU digital I/O to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "dio.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DioBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    zendio_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting zenoh-bridge-dio");
    info!(port = %config.serial.port, baud = config.serial.baud_rate, "Modbus RTU line");
    info!(
        inputs = config.inputs.len(),
        relays = config.relays.len(),
        "Configured devices"
    );

    // Fieldbus
    let mut fieldbus = ModbusRtu::new(config.serial.clone());
    if !fieldbus.connect().await {
        anyhow::bail!("Failed to open Modbus RTU port {}", config.serial.port);
    }

    // Zenoh
    let session = Arc::new(
        zendio_common::connect(&config.zenoh)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?,
    );
    let bus = ZenohBus::new(
        session.clone(),
        Duration::from_millis(config.publish_timeout_ms),
    );

    let mut engine = DioEngine::new(&config, fieldbus, bus);

    // Relay commands flow in through one wildcard subscription.
    let command_wildcard = topics::relay_command_wildcard(&config.topic_prefix);
    let subscriber = engine
        .bus()
        .spawn_command_subscriber(command_wildcard, engine.ingress());

    // Bridge presence for late joiners.
    let status_topic = topics::status_topic(&config.topic_prefix);
    let status = serde_json::json!({
        "bridge": "dio",
        "version": env!("CARGO_PKG_VERSION"),
        "inputs": config.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
        "relays": config.relays.iter().map(|r| &r.name).collect::<Vec<_>>(),
        "status": "running",
    });
    if !engine
        .bus()
        .publish(&status_topic, &status.to_string(), true)
        .await
    {
        warn!("Failed to publish bridge status");
    }

    // Stop and force-exit flags shared with the watchdog and signal task.
    let running = Arc::new(AtomicBool::new(true));
    let force = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());

    tokio::spawn(handle_signals(
        running.clone(),
        force.clone(),
        wake.clone(),
    ));

    // The watchdog asserts `force` when the cycle stalls. A loop wedged in
    // a hung fieldbus call cannot unwind by itself, so after a bounded
    // grace period the process is terminated from here.
    let watchdog = engine.start_watchdog(running.clone(), force.clone(), wake.clone());
    tokio::spawn(async move {
        if let Ok(WatchdogState::Tripped) = watchdog.await {
            tokio::time::sleep(WATCHDOG_EXIT_GRACE).await;
            error!("Main cycle did not unwind after watchdog trip, terminating");
            std::process::exit(1);
        }
    });

    engine
        .run(running.clone(), force.clone(), wake.clone())
        .await;

    // Teardown: offline status first, then the transports.
    info!("Shutting down");
    subscriber.abort();

    let status = serde_json::json!({ "bridge": "dio", "status": "offline" });
    let _ = engine
        .bus()
        .publish(&status_topic, &status.to_string(), true)
        .await;

    engine.shutdown().await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "Error closing Zenoh session");
    }

    info!("Bridge stopped");

    Ok(())
}

/// First signal requests a graceful stop at the next cycle boundary; a
/// second one forces exit after a short delay.
async fn handle_signals(running: Arc<AtomicBool>, force: Arc<AtomicBool>, wake: Arc<Notify>) {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to listen for Ctrl+C");
        return;
    }

    info!("Received shutdown signal");
    running.store(false, Ordering::SeqCst);
    wake.notify_waiters();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }

    error!("Received second shutdown signal, forcing exit");
    force.store(true, Ordering::SeqCst);
    wake.notify_waiters();

    tokio::time::sleep(Duration::from_secs(1)).await;
    std::process::exit(1);
}
