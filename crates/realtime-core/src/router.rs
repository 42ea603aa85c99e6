//! Cross-instance fan-out router.
//!
//! Abstracts "send an event to user X" so callers never know which process
//! holds the target connection. Every send runs both paths: local delivery
//! through this process's registry, and a broker publish on the user's
//! topic so any other process with a live connection also delivers it.
//!
//! Each subscriber skips messages that originated from its own instance
//! (local delivery already happened there), which keeps delivery
//! at-most-once per connection without any de-duplication store.
//!
//! Delivery is best-effort: if no connection exists anywhere the event is
//! dropped. Callers that need guaranteed delivery persist the underlying
//! entity first; the router is a low-latency notification path, not a
//! durable queue.

use crate::broker::Broker;
use crate::registry::SharedRegistry;
use async_trait::async_trait;
use common::events::EventEnvelope;
use common::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Topic prefix for per-user event topics.
const USER_TOPIC_PREFIX: &str = "rt:user:";

/// Pattern every instance subscribes to at startup.
const USER_TOPIC_PATTERN: &str = "rt:user:*";

/// Wire form of one published fan-out event.
#[derive(Debug, Serialize, Deserialize)]
struct PublishedEvent {
    /// Instance that published (and already delivered locally).
    origin: String,
    user_id: UserId,
    envelope: EventEnvelope,
}

/// Anything that can deliver an event to a user's live connections.
///
/// Services depend on this seam so tests can capture emitted events
/// without a broker.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Best-effort delivery to every live connection of the user.
    async fn send_to_user(&self, user_id: UserId, envelope: EventEnvelope);
}

/// The production fan-out router: registry for local delivery, broker for
/// every other process.
pub struct FanoutRouter {
    registry: SharedRegistry,
    broker: Arc<dyn Broker>,
    instance_id: String,
}

impl FanoutRouter {
    /// Create a router for one process instance.
    pub fn new(registry: SharedRegistry, broker: Arc<dyn Broker>, instance_id: String) -> Self {
        Self {
            registry,
            broker,
            instance_id,
        }
    }

    /// Topic for a user's events.
    fn user_topic(user_id: UserId) -> String {
        format!("{USER_TOPIC_PREFIX}{user_id}")
    }

    /// Spawn the inbound subscriber task.
    ///
    /// Subscribes to the user topic pattern and re-delivers each received
    /// event to any locally registered connection. Runs until cancelled or
    /// the broker stream ends.
    pub fn spawn_subscriber(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut receiver = match router.broker.subscribe(USER_TOPIC_PATTERN).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!(
                        target: "rt.router",
                        instance_id = %router.instance_id,
                        error = %e,
                        "Failed to subscribe to user topics, cross-instance delivery disabled"
                    );
                    return;
                }
            };

            info!(
                target: "rt.router",
                instance_id = %router.instance_id,
                pattern = USER_TOPIC_PATTERN,
                "Fan-out subscriber started"
            );

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(
                            target: "rt.router",
                            instance_id = %router.instance_id,
                            "Fan-out subscriber cancelled"
                        );
                        break;
                    }
                    message = receiver.recv() => {
                        match message {
                            Some(message) => router.handle_inbound(&message.payload).await,
                            None => {
                                warn!(
                                    target: "rt.router",
                                    instance_id = %router.instance_id,
                                    "Broker subscription closed"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Re-deliver one broker message to local connections.
    async fn handle_inbound(&self, payload: &[u8]) {
        let published: PublishedEvent = match serde_json::from_slice(payload) {
            Ok(published) => published,
            Err(e) => {
                warn!(target: "rt.router", error = %e, "Dropping malformed broker payload");
                return;
            }
        };

        // The origin instance already delivered to its own registry.
        if published.origin == self.instance_id {
            return;
        }

        let delivered = self
            .registry
            .deliver_local(published.user_id, &published.envelope)
            .await;

        debug!(
            target: "rt.router",
            user_id = %published.user_id,
            origin = %published.origin,
            delivered = delivered,
            "Re-delivered broker event"
        );
    }
}

#[async_trait]
impl EventSink for FanoutRouter {
    async fn send_to_user(&self, user_id: UserId, envelope: EventEnvelope) {
        // Local path.
        let delivered = self.registry.deliver_local(user_id, &envelope).await;

        // Broker path, always in parallel with local delivery. Failures are
        // swallowed by design: persisted state is authoritative, the router
        // is only a notification path.
        let published = PublishedEvent {
            origin: self.instance_id.clone(),
            user_id,
            envelope,
        };
        match serde_json::to_vec(&published) {
            Ok(payload) => {
                if let Err(e) = self
                    .broker
                    .publish(&Self::user_topic(user_id), payload)
                    .await
                {
                    warn!(
                        target: "rt.router",
                        user_id = %user_id,
                        error = %e,
                        "Broker publish failed, event delivered locally only"
                    );
                }
            }
            Err(e) => {
                warn!(target: "rt.router", error = %e, "Failed to serialize event");
            }
        }

        debug!(
            target: "rt.router",
            user_id = %user_id,
            local_delivered = delivered,
            "Fan-out send complete"
        );
    }
}
