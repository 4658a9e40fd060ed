//! Liveness supervision for the main cycle.
//!
//! A stuck fieldbus call (a hung serial read, a wedged USB adapter) can
//! freeze the polling loop with no symptom besides silence. The watchdog
//! samples the cycle heartbeat on its own schedule and, once the heartbeat
//! goes stale, asserts the shared force-exit flag so the process can be
//! torn down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info};

/// Interval between heartbeat samples, decoupled from the poll cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Watchdog lifecycle state. `Tripped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed,
    Tripped,
}

/// Supervisor for the main cycle's heartbeat.
///
/// The heartbeat is the number of milliseconds since `epoch` at which the
/// cycle last called `touch_heartbeat`. The watchdog trips when that value
/// falls more than `timeout` behind the current time while the bridge is
/// still meant to be running.
pub struct Watchdog {
    epoch: Instant,
    heartbeat: Arc<AtomicU64>,
    timeout: Duration,
    running: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
    wake: Arc<Notify>,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(
        epoch: Instant,
        heartbeat: Arc<AtomicU64>,
        timeout: Duration,
        running: Arc<AtomicBool>,
        force: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            epoch,
            heartbeat,
            timeout,
            running,
            force,
            wake,
            state: WatchdogState::Armed,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Sample the heartbeat until the bridge stops or the watchdog trips.
    ///
    /// On a trip the force flag is stored and the run loop's sleep is woken;
    /// the caller decides how hard to exit after that. The watchdog itself
    /// performs no I/O.
    pub async fn run(mut self) -> WatchdogState {
        info!(
            timeout_secs = self.timeout.as_secs(),
            "Watchdog armed"
        );

        while self.running.load(Ordering::SeqCst) && !self.force.load(Ordering::SeqCst) {
            tokio::time::sleep(SAMPLE_INTERVAL).await;

            let heartbeat_ms = self.heartbeat.load(Ordering::SeqCst);
            let now_ms = self.epoch.elapsed().as_millis() as u64;
            let stalled_ms = now_ms.saturating_sub(heartbeat_ms);

            if stalled_ms > self.timeout.as_millis() as u64
                && self.running.load(Ordering::SeqCst)
            {
                self.state = WatchdogState::Tripped;
                error!(
                    stalled_ms,
                    timeout_secs = self.timeout.as_secs(),
                    "Watchdog alarm: main cycle is not responding"
                );
                self.force.store(true, Ordering::SeqCst);
                self.wake.notify_waiters();
                break;
            }
        }

        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> (Arc<AtomicBool>, Arc<AtomicBool>, Arc<Notify>) {
        (
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_when_heartbeat_stalls() {
        let epoch = Instant::now();
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (running, force, wake) = flags();

        let waiter = {
            let wake = wake.clone();
            tokio::spawn(async move { wake.notified().await })
        };

        let watchdog = Watchdog::new(
            epoch,
            heartbeat,
            Duration::from_secs(10),
            running,
            force.clone(),
            wake,
        );

        let state = watchdog.run().await;

        assert_eq!(state, WatchdogState::Tripped);
        assert!(force.load(Ordering::SeqCst));
        // Samples land at 5s/10s/15s; 10s of stall is not yet over the
        // 10s budget, so the trip fires at timeout + one sample interval.
        assert_eq!(epoch.elapsed(), Duration::from_secs(15));

        // The trip must also wake the run loop out of its cycle sleep.
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("run loop was not woken")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_heartbeat_keeps_watchdog_armed() {
        let epoch = Instant::now();
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (running, force, wake) = flags();

        let watchdog = Watchdog::new(
            epoch,
            heartbeat.clone(),
            Duration::from_secs(10),
            running.clone(),
            force.clone(),
            wake,
        );
        let handle = tokio::spawn(watchdog.run());

        // A healthy cycle: the heartbeat advances every 2s.
        let refresher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                heartbeat.store(epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        running.store(false, Ordering::SeqCst);

        let state = handle.await.unwrap();
        assert_eq!(state, WatchdogState::Armed);
        assert!(!force.load(Ordering::SeqCst));

        refresher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_ends_watchdog_without_trip() {
        let epoch = Instant::now();
        let heartbeat = Arc::new(AtomicU64::new(0));
        let (running, force, wake) = flags();

        running.store(false, Ordering::SeqCst);

        let watchdog = Watchdog::new(
            epoch,
            heartbeat,
            Duration::from_secs(10),
            running,
            force.clone(),
            wake,
        );

        let state = watchdog.run().await;
        assert_eq!(state, WatchdogState::Armed);
        assert!(!force.load(Ordering::SeqCst));
    }
}
