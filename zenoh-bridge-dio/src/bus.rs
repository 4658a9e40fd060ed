//! Zenoh bus access: publishing and the relay command subscription.
//!
//! Retained publishes go through a `zenoh-ext` advanced publisher with a
//! one-sample cache, so late-joining subscribers immediately receive the
//! last known state of every input and relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zenoh::Session;
use zenoh::sample::SampleKind;
use zenoh_ext::{AdvancedPublisher, AdvancedPublisherBuilderExt, CacheConfig};

use crate::engine::CommandIngress;

/// Snapshot of the bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub publish_success: u64,
    pub publish_errors: u64,
    pub messages_received: u64,
}

/// Access to the publish side of the message bus.
///
/// The engine is generic over this trait; tests drive it with in-memory
/// implementations.
#[async_trait]
pub trait BusPort {
    /// Publish a payload. Returns `true` on success; failures are counted
    /// and logged here, never retried by the caller.
    async fn publish(&self, topic: &str, payload: &str, retained: bool) -> bool;

    /// Snapshot the running counters.
    fn stats(&self) -> BusStats;

    /// Reset the running counters to zero.
    fn reset_stats(&self);
}

/// Zenoh implementation of [`BusPort`].
pub struct ZenohBus {
    session: Arc<Session>,
    operation_timeout: Duration,
    /// Lazily-created retained publishers, one per topic.
    retained: RwLock<HashMap<String, AdvancedPublisher<'static>>>,
    publish_success: AtomicU64,
    publish_errors: AtomicU64,
    messages_received: Arc<AtomicU64>,
}

impl ZenohBus {
    /// Create a bus port over an open session.
    pub fn new(session: Arc<Session>, operation_timeout: Duration) -> Self {
        Self {
            session,
            operation_timeout,
            retained: RwLock::new(HashMap::new()),
            publish_success: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            messages_received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether the underlying session is still open.
    pub fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }

    /// Spawn the task that forwards relay command samples to the engine.
    ///
    /// The task only parses and appends to the engine's command queue; it
    /// never touches the fieldbus.
    pub fn spawn_command_subscriber(
        &self,
        key_expr: String,
        ingress: CommandIngress,
    ) -> JoinHandle<()> {
        let session = self.session.clone();
        let received = self.messages_received.clone();

        tokio::spawn(async move {
            let subscriber = match session.declare_subscriber(&key_expr).await {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    error!(key_expr = %key_expr, error = %e, "Failed to subscribe to relay commands");
                    return;
                }
            };

            info!(key_expr = %key_expr, "Subscribed to relay commands");

            while let Ok(sample) = subscriber.recv_async().await {
                if sample.kind() == SampleKind::Delete {
                    continue;
                }

                received.fetch_add(1, Ordering::Relaxed);

                let payload = sample.payload().to_bytes();
                let payload = String::from_utf8_lossy(&payload);
                ingress.on_bus_message(sample.key_expr().as_str(), &payload);
            }
        })
    }

    async fn ensure_retained_publisher(&self, topic: &str) -> Result<(), String> {
        {
            let publishers = self.retained.read().await;
            if publishers.contains_key(topic) {
                return Ok(());
            }
        }

        // One cached sample per topic gives late joiners the last value.
        let publisher = self
            .session
            .declare_publisher(topic.to_string())
            .cache(CacheConfig::default().max_samples(1))
            .await
            .map_err(|e| e.to_string())?;

        // Safety: the publisher borrows the session, which the Arc keeps
        // alive for as long as this struct exists.
        let publisher: AdvancedPublisher<'static> = unsafe { std::mem::transmute(publisher) };

        self.retained
            .write()
            .await
            .insert(topic.to_string(), publisher);

        debug!(topic, "Created retained publisher");

        Ok(())
    }

    async fn retained_put(&self, topic: &str, payload: &str) -> Result<(), String> {
        self.ensure_retained_publisher(topic).await?;

        let publishers = self.retained.read().await;
        let Some(publisher) = publishers.get(topic) else {
            return Err("retained publisher missing".to_string());
        };

        match tokio::time::timeout(self.operation_timeout, publisher.put(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("operation timed out".to_string()),
        }
    }

    async fn plain_put(&self, topic: &str, payload: &str) -> Result<(), String> {
        match tokio::time::timeout(self.operation_timeout, self.session.put(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("operation timed out".to_string()),
        }
    }
}

#[async_trait]
impl BusPort for ZenohBus {
    async fn publish(&self, topic: &str, payload: &str, retained: bool) -> bool {
        let result = if retained {
            self.retained_put(topic, payload).await
        } else {
            self.plain_put(topic, payload).await
        };

        match result {
            Ok(()) => {
                self.publish_success.fetch_add(1, Ordering::Relaxed);
                debug!(topic, payload, "Published");
                true
            }
            Err(e) => {
                self.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %e, "Publish failed");
                false
            }
        }
    }

    fn stats(&self) -> BusStats {
        BusStats {
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    fn reset_stats(&self) {
        self.publish_success.store(0, Ordering::Relaxed);
        self.publish_errors.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
    }
}
