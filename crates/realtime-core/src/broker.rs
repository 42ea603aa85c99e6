//! Publish/subscribe broker abstraction.
//!
//! The fan-out router only needs `publish(topic, payload)` and
//! `subscribe(pattern)`, so any message broker can back it. Production uses
//! Redis pub/sub; tests share an in-memory hub across simulated processes.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently; publishing clones it per call. Subscription holds its own
//! pub/sub connection drained by a forwarding task.

use crate::errors::CoreError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Buffer size of a subscription's inbound queue.
const SUBSCRIPTION_QUEUE_DEPTH: usize = 1024;

/// One message received from the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

/// Minimal broker contract backing the fan-out router.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload on a topic. Errors map to `Unavailable`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError>;

    /// Subscribe to a topic pattern (`*` wildcard). Messages arrive on the
    /// returned channel until the broker connection or receiver is dropped.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>, CoreError>;
}

/// Redis pub/sub broker.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Unavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CoreError> {
        // Do NOT log redis_url; it may contain credentials.
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "rt.broker.redis", error = %e, "Failed to open Redis client");
            CoreError::Unavailable(format!("failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "rt.broker.redis", error = %e, "Failed to connect to Redis");
                CoreError::Unavailable(format!("failed to connect to Redis: {e}"))
            })?;

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.publish(topic, payload).await.map_err(|e| {
            warn!(target: "rt.broker.redis", topic = %topic, error = %e, "Publish failed");
            CoreError::Unavailable(format!("publish failed: {e}"))
        })?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BrokerMessage>, CoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            error!(target: "rt.broker.redis", error = %e, "Failed to open pub/sub connection");
            CoreError::Unavailable(format!("pub/sub connect failed: {e}"))
        })?;

        pubsub.psubscribe(pattern).await.map_err(|e| {
            error!(target: "rt.broker.redis", pattern = %pattern, error = %e, "psubscribe failed");
            CoreError::Unavailable(format!("psubscribe failed: {e}"))
        })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        let pattern_owned = pattern.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let topic = msg.get_channel_name().to_string();
                let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                if tx
                    .send(BrokerMessage { topic, payload })
                    .await
                    .is_err()
                {
                    // Receiver dropped; stop draining.
                    break;
                }
            }
            debug!(
                target: "rt.broker.redis",
                pattern = %pattern_owned,
                "Subscription stream ended"
            );
        });

        Ok(rx)
    }
}

/// Glob match with a single `*` wildcard, as Redis `PSUBSCRIBE` uses.
fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            topic.len() >= prefix.len() + suffix.len()
                && topic.starts_with(prefix)
                && topic.ends_with(suffix)
        }
        None => pattern == topic,
    }
}

/// In-memory broker used by tests and local development.
pub mod memory {
    use super::{pattern_matches, Broker, BrokerMessage, CoreError, SUBSCRIPTION_QUEUE_DEPTH};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    struct Subscription {
        pattern: String,
        sender: mpsc::Sender<BrokerMessage>,
    }

    /// A process-shared in-memory hub.
    ///
    /// Clones share the same subscriber list, so two broker handles model
    /// two server instances attached to one broker.
    #[derive(Clone, Default)]
    pub struct InMemoryBroker {
        subscriptions: Arc<Mutex<Vec<Subscription>>>,
    }

    impl InMemoryBroker {
        /// Create an empty hub.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Broker for InMemoryBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.retain(|sub| !sub.sender.is_closed());
            for sub in subscriptions.iter() {
                if pattern_matches(&sub.pattern, topic) {
                    let _ = sub
                        .sender
                        .send(BrokerMessage {
                            topic: topic.to_string(),
                            payload: payload.clone(),
                        })
                        .await;
                }
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            pattern: &str,
        ) -> Result<mpsc::Receiver<BrokerMessage>, CoreError> {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
            self.subscriptions.lock().await.push(Subscription {
                pattern: pattern.to_string(),
                sender: tx,
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::memory::InMemoryBroker;
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("rt:user:*", "rt:user:abc"));
        assert!(pattern_matches("rt:user:*", "rt:user:"));
        assert!(!pattern_matches("rt:user:*", "rt:call:abc"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_memory_broker_routes_by_pattern() {
        let broker = InMemoryBroker::new();
        let mut user_rx = broker.subscribe("rt:user:*").await.unwrap();
        let mut other_rx = broker.subscribe("rt:other:*").await.unwrap();

        broker
            .publish("rt:user:42", b"hello".to_vec())
            .await
            .unwrap();

        let msg = user_rx.recv().await.unwrap();
        assert_eq!(msg.topic, "rt:user:42");
        assert_eq!(msg.payload, b"hello");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_broker_fans_out_to_all_matching_subscribers() {
        let broker = InMemoryBroker::new();
        let mut first = broker.subscribe("rt:user:*").await.unwrap();
        let mut second = broker.subscribe("rt:user:*").await.unwrap();

        broker.publish("rt:user:1", b"x".to_vec()).await.unwrap();

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_memory_broker_drops_closed_subscribers() {
        let broker = InMemoryBroker::new();
        let rx = broker.subscribe("rt:user:*").await.unwrap();
        drop(rx);

        // Publishing after the receiver is gone must not error.
        broker.publish("rt:user:1", b"x".to_vec()).await.unwrap();
    }
}
