//! Device synchronization engine.
//!
//! The engine keeps the configured digital inputs and relays in sync with
//! the bus: a fixed-cadence cycle reads input blocks per slave, publishes
//! state changes (plus a periodic refresh of unchanged state), and applies
//! a bounded slice of the queued relay commands. Inbound commands arrive
//! asynchronously from the bus subscriber and only ever append to the
//! command queue, so ingestion never competes with the cycle for the
//! fieldbus.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use zendio_common::topics;

use crate::bus::BusPort;
use crate::config::{DioBridgeConfig, PollingConfig};
use crate::fieldbus::FieldbusPort;
use crate::watchdog::{Watchdog, WatchdogState};

/// A queued relay write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub relay: String,
    pub on: bool,
}

/// FIFO of relay commands, shared between the subscriber task and the
/// cycle. The lock is held only for the O(1) append and the O(k) drain,
/// never across I/O.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<RelayCommand>>,
}

impl CommandQueue {
    /// Append a command at the back of the queue.
    pub fn push(&self, command: RelayCommand) {
        self.inner.lock().unwrap().push_back(command);
    }

    /// Remove up to `max` commands from the front, oldest first.
    ///
    /// Returns the drained commands and the depth left behind. Commands
    /// beyond `max` stay queued for a later cycle; nothing is dropped.
    pub fn drain(&self, max: usize) -> (Vec<RelayCommand>, usize) {
        let mut queue = self.inner.lock().unwrap();
        let take = queue.len().min(max);
        let drained = queue.drain(..take).collect();
        (drained, queue.len())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cheap handle that carries command ingestion into the subscriber task.
#[derive(Clone)]
pub struct CommandIngress {
    queue: Arc<CommandQueue>,
    topic_prefix: String,
}

impl CommandIngress {
    /// Parse an inbound bus message and enqueue the resulting command.
    ///
    /// Non-matching topics are ignored; any payload other than
    /// `"ON"`/`"1"`/`"true"` switches off. Append-only: this never blocks
    /// on fieldbus or bus I/O.
    pub fn on_bus_message(&self, topic: &str, payload: &str) {
        let Some(relay) = topics::parse_relay_command(&self.topic_prefix, topic) else {
            return;
        };
        let on = topics::parse_switch_payload(payload);

        self.queue.push(RelayCommand {
            relay: relay.to_string(),
            on,
        });

        debug!(relay, on, "Queued relay command");
    }
}

/// A monitored input with its resolved topic and last published state.
struct InputPoint {
    address: u8,
    name: String,
    topic: String,
    last_known: bool,
    last_publish: Instant,
}

/// A controlled relay with its resolved confirmation topic.
struct RelayPoint {
    slave_id: u8,
    address: u16,
    name: String,
    state_topic: String,
    current: bool,
}

/// The synchronization engine. Owns the two ports and all per-device
/// state; everything except the command queue is touched only by the
/// cycle.
pub struct DioEngine<F, B> {
    fieldbus: F,
    bus: B,
    polling: PollingConfig,
    inputs: Vec<InputPoint>,
    /// Input indexes grouped by slave, ascending slave order. Computed
    /// once; the descriptor list is immutable for the process lifetime.
    groups: BTreeMap<u8, Vec<usize>>,
    relays: HashMap<String, RelayPoint>,
    queue: Arc<CommandQueue>,
    ingress: CommandIngress,
    epoch: Instant,
    heartbeat: Arc<AtomicU64>,
    last_stats: Instant,
}

impl<F: FieldbusPort, B: BusPort> DioEngine<F, B> {
    /// Build the engine from the loaded configuration and connected ports.
    pub fn new(config: &DioBridgeConfig, fieldbus: F, bus: B) -> Self {
        let now = Instant::now();

        let inputs: Vec<InputPoint> = config
            .inputs
            .iter()
            .map(|input| InputPoint {
                address: input.address,
                name: input.name.clone(),
                topic: input.resolved_state_topic(&config.topic_prefix),
                last_known: false,
                last_publish: now,
            })
            .collect();

        let mut groups: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (idx, input) in config.inputs.iter().enumerate() {
            groups.entry(input.slave_id).or_default().push(idx);
        }

        let relays = config
            .relays
            .iter()
            .map(|relay| {
                (
                    relay.name.clone(),
                    RelayPoint {
                        slave_id: relay.slave_id,
                        address: relay.address,
                        name: relay.name.clone(),
                        state_topic: relay.resolved_state_topic(&config.topic_prefix),
                        current: false,
                    },
                )
            })
            .collect();

        let queue = Arc::new(CommandQueue::default());
        let ingress = CommandIngress {
            queue: queue.clone(),
            topic_prefix: config.topic_prefix.clone(),
        };

        Self {
            fieldbus,
            bus,
            polling: config.polling.clone(),
            inputs,
            groups,
            relays,
            queue,
            ingress,
            epoch: now,
            heartbeat: Arc::new(AtomicU64::new(0)),
            last_stats: now,
        }
    }

    /// Handle for the subscriber task.
    pub fn ingress(&self) -> CommandIngress {
        self.ingress.clone()
    }

    /// Entry point for inbound bus messages; append-only.
    pub fn on_bus_message(&self, topic: &str, payload: &str) {
        self.ingress.on_bus_message(topic, payload);
    }

    /// Access the bus port (status publishes, subscriber setup).
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Access the fieldbus port.
    pub fn fieldbus(&self) -> &F {
        &self.fieldbus
    }

    /// Record that the cycle is alive.
    pub fn touch_heartbeat(&self) {
        self.heartbeat
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    /// Read every slave's input block and publish what the decision rule
    /// selects: changed state, state older than the refresh interval, or
    /// everything when `force` is set.
    pub async fn poll(&mut self, force: bool) {
        let refresh = Duration::from_secs(self.polling.refresh_interval_secs);

        for (&slave_id, members) in &self.groups {
            let Some(block) = self.fieldbus.read_discrete_block(slave_id, 0).await else {
                // Failed group: skip this cycle. The port already counted
                // and logged the failure.
                continue;
            };

            for &idx in members {
                let point = &mut self.inputs[idx];
                let current = block[point.address as usize];
                let changed = current != point.last_known;

                if force || changed || point.last_publish.elapsed() >= refresh {
                    let payload = if current { "ON" } else { "OFF" };

                    if self.bus.publish(&point.topic, payload, true).await && changed {
                        debug!(input = %point.name, state = payload, "Input changed");
                    }

                    // A failed publish still counts as synced; the refresh
                    // interval re-publishes it within refresh_interval_secs.
                    point.last_publish = Instant::now();
                }

                point.last_known = current;
            }
        }
    }

    /// Apply up to `max_commands_per_cycle` queued relay commands, oldest
    /// first. The remainder stays queued for a later cycle.
    pub async fn drain_and_apply(&mut self) {
        let (commands, remaining) = self.queue.drain(self.polling.max_commands_per_cycle);

        if remaining > 0 {
            warn!(
                remaining,
                per_cycle = self.polling.max_commands_per_cycle,
                "Relay command queue exceeds drain capacity"
            );
        }

        for command in commands {
            // Unknown relay: a command for a renamed or removed device.
            // Not an error, just stale.
            let Some(relay) = self.relays.get_mut(&command.relay) else {
                continue;
            };

            if self
                .fieldbus
                .write_single_bit(relay.slave_id, relay.address, command.on)
                .await
            {
                relay.current = command.on;
                let payload = if command.on { "ON" } else { "OFF" };

                // Confirmation publish failure is not a command failure;
                // the coil is already switched.
                self.bus.publish(&relay.state_topic, payload, true).await;

                debug!(relay = %relay.name, state = payload, "Relay switched");
            } else {
                error!(relay = %command.relay, "Failed to switch relay");
            }
        }
    }

    /// Log and reset the port counters once per statistics interval.
    pub fn maybe_log_statistics(&mut self) {
        if self.last_stats.elapsed() < Duration::from_secs(self.polling.stats_interval_secs) {
            return;
        }

        let fieldbus = self.fieldbus.stats();
        let bus = self.bus.stats();

        let reads = fieldbus.read_success + fieldbus.read_errors;
        let writes = fieldbus.write_success + fieldbus.write_errors;
        let publishes = bus.publish_success + bus.publish_errors;

        info!(
            reads,
            read_pct = success_pct(fieldbus.read_success, reads),
            writes,
            write_pct = success_pct(fieldbus.write_success, writes),
            publishes,
            publish_pct = success_pct(bus.publish_success, publishes),
            received = bus.messages_received,
            queued = self.queue.len(),
            "Bridge statistics"
        );

        self.fieldbus.reset_stats();
        self.bus.reset_stats();
        self.last_stats = Instant::now();
    }

    /// Spawn the watchdog on its own task.
    pub fn start_watchdog(
        &self,
        running: Arc<AtomicBool>,
        force: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> JoinHandle<WatchdogState> {
        let watchdog = Watchdog::new(
            self.epoch,
            self.heartbeat.clone(),
            Duration::from_secs(self.polling.watchdog_timeout_secs),
            running,
            force,
            wake,
        );

        tokio::spawn(watchdog.run())
    }

    /// Run the cycle until a stop is requested or the force flag is set.
    ///
    /// The sleep compensates for processing time, so the effective period
    /// stays close to `poll_interval_ms`. Stop requests take effect at
    /// cycle boundaries; the force flag additionally cuts the sleep short
    /// through `wake`.
    pub async fn run(&mut self, running: Arc<AtomicBool>, force: Arc<AtomicBool>, wake: Arc<Notify>) {
        let interval = Duration::from_millis(self.polling.poll_interval_ms);

        info!(
            poll_interval_ms = self.polling.poll_interval_ms,
            refresh_interval_secs = self.polling.refresh_interval_secs,
            inputs = self.inputs.len(),
            relays = self.relays.len(),
            "Starting polling loop"
        );

        while running.load(Ordering::SeqCst) && !force.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();

            self.touch_heartbeat();
            self.poll(false).await;
            self.drain_and_apply().await;
            self.maybe_log_statistics();

            if let Some(remaining) = interval.checked_sub(cycle_start.elapsed()) {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = wake.notified() => {}
                }
            }
        }

        info!("Polling loop terminated");
    }

    /// Disconnect the fieldbus and consume the engine.
    pub async fn shutdown(mut self) {
        self.fieldbus.disconnect().await;
    }
}

fn success_pct(ok: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        ok as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusStats;
    use crate::config::{InputConfig, RelayConfig, SerialConfig};
    use crate::fieldbus::{DISCRETE_BLOCK_LEN, FieldbusStats};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct MockFieldbus {
        blocks: HashMap<u8, [bool; DISCRETE_BLOCK_LEN]>,
        writes: Vec<(u8, u16, bool)>,
        write_ok: bool,
        resets: AtomicU32,
    }

    impl MockFieldbus {
        fn new() -> Self {
            Self {
                blocks: HashMap::new(),
                writes: Vec::new(),
                write_ok: true,
                resets: AtomicU32::new(0),
            }
        }

        fn with_block(mut self, slave_id: u8, block: [bool; DISCRETE_BLOCK_LEN]) -> Self {
            self.blocks.insert(slave_id, block);
            self
        }
    }

    #[async_trait]
    impl FieldbusPort for MockFieldbus {
        async fn connect(&mut self) -> bool {
            true
        }

        async fn disconnect(&mut self) {}

        fn is_connected(&self) -> bool {
            true
        }

        async fn read_discrete_block(
            &mut self,
            slave_id: u8,
            _start_addr: u16,
        ) -> Option<[bool; DISCRETE_BLOCK_LEN]> {
            self.blocks.get(&slave_id).copied()
        }

        async fn write_single_bit(&mut self, slave_id: u8, address: u16, value: bool) -> bool {
            self.writes.push((slave_id, address, value));
            self.write_ok
        }

        fn stats(&self) -> FieldbusStats {
            FieldbusStats::default()
        }

        fn reset_stats(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct MockBus {
        published: Mutex<Vec<(String, String, bool)>>,
        publish_ok: bool,
        resets: AtomicU32,
    }

    impl MockBus {
        fn new(publish_ok: bool) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                publish_ok,
                resets: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BusPort for MockBus {
        async fn publish(&self, topic: &str, payload: &str, retained: bool) -> bool {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string(), retained));
            self.publish_ok
        }

        fn stats(&self) -> BusStats {
            BusStats::default()
        }

        fn reset_stats(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn input(slave_id: u8, address: u8, name: &str) -> InputConfig {
        InputConfig {
            slave_id,
            address,
            name: name.to_string(),
            state_topic: None,
        }
    }

    fn relay(slave_id: u8, address: u16, name: &str) -> RelayConfig {
        RelayConfig {
            slave_id,
            address,
            name: name.to_string(),
            command_topic: None,
            state_topic: None,
        }
    }

    fn test_config(inputs: Vec<InputConfig>, relays: Vec<RelayConfig>) -> DioBridgeConfig {
        DioBridgeConfig {
            zenoh: Default::default(),
            serial: SerialConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                data_bits: 8,
                parity: "none".to_string(),
                stop_bits: 1,
                response_timeout_ms: 300,
                retry_delay_ms: 50,
                max_retries: 3,
            },
            polling: PollingConfig {
                poll_interval_ms: 100,
                refresh_interval_secs: 10,
                max_commands_per_cycle: 10,
                watchdog_timeout_secs: 10,
                stats_interval_secs: 60,
            },
            topic_prefix: "zendio/modbus".to_string(),
            publish_timeout_ms: 500,
            inputs,
            relays,
            logging: Default::default(),
        }
    }

    fn published(engine: &DioEngine<MockFieldbus, MockBus>) -> Vec<(String, String, bool)> {
        engine.bus.published.lock().unwrap().clone()
    }

    fn block_with(bits: &[usize]) -> [bool; DISCRETE_BLOCK_LEN] {
        let mut block = [false; DISCRETE_BLOCK_LEN];
        for &bit in bits {
            block[bit] = true;
        }
        block
    }

    #[test]
    fn test_command_queue_drain_is_bounded_fifo() {
        let queue = CommandQueue::default();
        for i in 0..5 {
            queue.push(RelayCommand {
                relay: format!("r{}", i),
                on: true,
            });
        }

        let (first, remaining) = queue.drain(3);
        let names: Vec<_> = first.iter().map(|c| c.relay.as_str()).collect();
        assert_eq!(names, ["r0", "r1", "r2"]);
        assert_eq!(remaining, 2);

        let (second, remaining) = queue.drain(3);
        let names: Vec<_> = second.iter().map(|c| c.relay.as_str()).collect();
        assert_eq!(names, ["r3", "r4"]);
        assert_eq!(remaining, 0);

        let (third, remaining) = queue.drain(3);
        assert!(third.is_empty());
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_poll_publishes_on_for_set_bits() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0, 1]));
        let config = test_config(vec![input(1, 0, "door"), input(1, 1, "motion")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.poll(false).await;

        let published = published(&engine);
        assert_eq!(published.len(), 2);
        assert!(published.contains(&(
            "zendio/modbus/input/door/state".to_string(),
            "ON".to_string(),
            true
        )));
        assert!(published.contains(&(
            "zendio/modbus/input/motion/state".to_string(),
            "ON".to_string(),
            true
        )));
    }

    #[tokio::test]
    async fn test_poll_skips_failed_slave_group() {
        // Slave 1 has no block configured, so its read fails; slave 2 reads.
        let fieldbus = MockFieldbus::new().with_block(2, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "broken"), input(2, 0, "healthy")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.poll(false).await;

        let published = published(&engine);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "zendio/modbus/input/healthy/state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_input_is_debounced_until_refresh() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.poll(false).await; // initial transition
        assert_eq!(published(&engine).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        engine.poll(false).await; // unchanged, refresh not due
        assert_eq!(published(&engine).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        engine.poll(false).await; // refresh due
        assert_eq!(published(&engine).len(), 2);
        assert_eq!(published(&engine)[1].1, "ON");
    }

    #[tokio::test]
    async fn test_transition_publishes_immediately() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.poll(false).await;
        engine.fieldbus.blocks.insert(1, block_with(&[]));
        engine.poll(false).await;

        let payloads: Vec<_> = published(&engine).iter().map(|p| p.1.clone()).collect();
        assert_eq!(payloads, ["ON", "OFF"]);
    }

    #[tokio::test]
    async fn test_force_republishes_unchanged_state() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.poll(false).await;
        engine.poll(true).await;

        assert_eq!(published(&engine).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_publish_still_marks_state_synced() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(false));

        engine.poll(false).await;
        engine.poll(false).await;

        // The transition was attempted once; the failed publish does not
        // make the next cycle treat the state as still changed.
        assert_eq!(published(&engine).len(), 1);
    }

    #[tokio::test]
    async fn test_relay_on_then_off_applied_in_order() {
        let config = test_config(vec![], vec![relay(1, 0, "r1")]);
        let mut engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        engine.on_bus_message("zendio/modbus/relay/r1/set", "ON");
        engine.on_bus_message("zendio/modbus/relay/r1/set", "OFF");
        engine.drain_and_apply().await;

        assert_eq!(engine.fieldbus.writes, [(1, 0, true), (1, 0, false)]);
        assert!(!engine.relays["r1"].current);

        let confirmations = published(&engine);
        assert_eq!(confirmations.len(), 2);
        assert_eq!(
            confirmations[0],
            (
                "zendio/modbus/relay/r1/state".to_string(),
                "ON".to_string(),
                true
            )
        );
        assert_eq!(confirmations[1].1, "OFF");
    }

    #[tokio::test]
    async fn test_drain_applies_at_most_max_commands_per_cycle() {
        let mut config = test_config(vec![], vec![relay(1, 0, "r1")]);
        config.polling.max_commands_per_cycle = 2;
        let mut engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        for _ in 0..5 {
            engine.on_bus_message("zendio/modbus/relay/r1/set", "ON");
        }

        engine.drain_and_apply().await;
        assert_eq!(engine.fieldbus.writes.len(), 2);
        assert_eq!(engine.queue.len(), 3);

        engine.drain_and_apply().await;
        engine.drain_and_apply().await;
        assert_eq!(engine.fieldbus.writes.len(), 5);
        assert!(engine.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_relay_command_is_discarded() {
        let config = test_config(vec![], vec![relay(1, 0, "r1")]);
        let mut engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        engine.on_bus_message("zendio/modbus/relay/ghost/set", "ON");
        engine.drain_and_apply().await;

        assert!(engine.fieldbus.writes.is_empty());
        assert!(published(&engine).is_empty());
        assert!(engine.queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_command_topics_enqueue_nothing() {
        let config = test_config(vec![], vec![relay(1, 0, "r1")]);
        let engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        engine.on_bus_message("zendio/modbus/input/door/state", "ON");
        engine.on_bus_message("other/relay/r1/set", "ON");
        engine.on_bus_message("zendio/modbus/relay/r1/state", "ON");

        assert!(engine.queue.is_empty());
    }

    #[tokio::test]
    async fn test_payload_mapping_reaches_the_coil() {
        let config = test_config(vec![], vec![relay(1, 0, "r1")]);
        let mut engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        engine.on_bus_message("zendio/modbus/relay/r1/set", "1");
        engine.on_bus_message("zendio/modbus/relay/r1/set", "true");
        engine.on_bus_message("zendio/modbus/relay/r1/set", "xyz");
        engine.on_bus_message("zendio/modbus/relay/r1/set", "");
        engine.drain_and_apply().await;

        let states: Vec<bool> = engine.fieldbus.writes.iter().map(|w| w.2).collect();
        assert_eq!(states, [true, true, false, false]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_relay_state_untouched() {
        let config = test_config(vec![], vec![relay(1, 4, "r1")]);
        let mut fieldbus = MockFieldbus::new();
        fieldbus.write_ok = false;
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));

        engine.on_bus_message("zendio/modbus/relay/r1/set", "ON");
        engine.drain_and_apply().await;

        assert_eq!(engine.fieldbus.writes, [(1, 4, true)]);
        assert!(!engine.relays["r1"].current);
        assert!(published(&engine).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_reset_after_interval() {
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, MockFieldbus::new(), MockBus::new(true));

        engine.maybe_log_statistics();
        assert_eq!(engine.fieldbus.resets.load(Ordering::Relaxed), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        engine.maybe_log_statistics();
        assert_eq!(engine.fieldbus.resets.load(Ordering::Relaxed), 1);
        assert_eq!(engine.bus.resets.load(Ordering::Relaxed), 1);

        // The gate re-arms after a reset.
        engine.maybe_log_statistics();
        assert_eq!(engine.fieldbus.resets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_touches_heartbeat_and_honors_stop() {
        let fieldbus = MockFieldbus::new().with_block(1, block_with(&[0]));
        let config = test_config(vec![input(1, 0, "door")], vec![]);
        let mut engine = DioEngine::new(&config, fieldbus, MockBus::new(true));
        let heartbeat = engine.heartbeat.clone();

        let running = Arc::new(AtomicBool::new(true));
        let force = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let handle = {
            let running = running.clone();
            let force = force.clone();
            let wake = wake.clone();
            tokio::spawn(async move {
                engine.run(running, force, wake).await;
                engine
            })
        };

        // Cycles land at 0/100/200/300ms with a 100ms interval.
        tokio::time::sleep(Duration::from_millis(350)).await;
        running.store(false, Ordering::SeqCst);
        wake.notify_waiters();

        let engine = handle.await.unwrap();
        assert!(heartbeat.load(Ordering::SeqCst) >= 300);

        // Constant input: one transition publish, refresh far away.
        assert_eq!(published(&engine).len(), 1);
    }
}
