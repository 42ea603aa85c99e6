//! Per-process connection registry.
//!
//! Maps a user to its live transport connections and is the unit that
//! actually pushes events to a socket. Owned by exactly one process and
//! never persisted; a process restart empties it by construction.
//!
//! The registry is an explicitly injected component, not a module-level
//! singleton, so tests run several isolated instances side by side.

use common::events::EventEnvelope;
use common::types::{ConnectionId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// Buffer size of a single connection's outbound queue.
const CONNECTION_QUEUE_DEPTH: usize = 64;

/// Buffer size of the presence-change broadcast channel.
const PRESENCE_CHANNEL_DEPTH: usize = 256;

/// Emitted when a user's connection set transitions empty <-> non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
}

/// Outbound half of one live connection.
///
/// The transport layer drains the paired receiver and writes to the socket.
#[derive(Clone)]
pub struct ConnectionSender {
    sender: mpsc::Sender<EventEnvelope>,
}

impl ConnectionSender {
    /// Create a connection queue. Returns the registry-side sender and the
    /// transport-side receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        (Self { sender }, receiver)
    }

    /// Best-effort enqueue. A full or closed queue drops the event.
    fn deliver(&self, envelope: &EventEnvelope) -> bool {
        self.sender.try_send(envelope.clone()).is_ok()
    }
}

/// Per-process map from user identity to live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, HashMap<ConnectionId, ConnectionSender>>>,
    presence_tx: broadcast::Sender<PresenceChange>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (presence_tx, _) = broadcast::channel(PRESENCE_CHANNEL_DEPTH);
        Self {
            connections: RwLock::new(HashMap::new()),
            presence_tx,
        }
    }

    /// Subscribe to presence-change events.
    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence_tx.subscribe()
    }

    /// Register a connection for a user.
    ///
    /// Idempotent per connection id: re-registering replaces the sender.
    /// Emits a presence change when this is the user's first connection.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        sender: ConnectionSender,
    ) {
        let came_online = {
            let mut connections = self.connections.write().await;
            let user_connections = connections.entry(user_id).or_default();
            let was_empty = user_connections.is_empty();
            user_connections.insert(connection_id, sender);
            was_empty
        };

        debug!(
            target: "rt.registry",
            user_id = %user_id,
            connection_id = %connection_id,
            came_online = came_online,
            "Connection registered"
        );

        if came_online {
            let _ = self.presence_tx.send(PresenceChange {
                user_id,
                online: true,
            });
        }
    }

    /// Remove exactly one connection.
    ///
    /// Unknown connections are a no-op, not a fault; disconnect races are
    /// expected. Emits a presence change when the user's set becomes empty.
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let went_offline = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(&user_id) {
                Some(user_connections) => {
                    if user_connections.remove(&connection_id).is_none() {
                        return;
                    }
                    if user_connections.is_empty() {
                        connections.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => return,
            }
        };

        debug!(
            target: "rt.registry",
            user_id = %user_id,
            connection_id = %connection_id,
            went_offline = went_offline,
            "Connection unregistered"
        );

        if went_offline {
            let _ = self.presence_tx.send(PresenceChange {
                user_id,
                online: false,
            });
        }
    }

    /// Whether the user has at least one live connection in this process.
    pub async fn has_connection(&self, user_id: UserId) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    /// Number of live connections for the user in this process.
    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.connections
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    /// Deliver an event to every local connection of the user.
    ///
    /// Returns how many connections accepted the event. Delivery is
    /// at-most-once per connection and best-effort.
    pub async fn deliver_local(&self, user_id: UserId, envelope: &EventEnvelope) -> usize {
        let connections = self.connections.read().await;
        let Some(user_connections) = connections.get(&user_id) else {
            return 0;
        };

        user_connections
            .values()
            .filter(|sender| sender.deliver(envelope))
            .count()
    }
}

/// Shared registry handle.
pub type SharedRegistry = Arc<ConnectionRegistry>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::events::RealtimeEvent;
    use common::types::ConversationId;

    fn typing_event() -> EventEnvelope {
        EventEnvelope::now(RealtimeEvent::Typing {
            conversation_id: ConversationId::new(),
            user_id: UserId::new(),
        })
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (sender, mut receiver) = ConnectionSender::channel();

        registry.register(user, ConnectionId::new(), sender).await;
        assert!(registry.has_connection(user).await);

        let delivered = registry.deliver_local(user, &typing_event()).await;
        assert_eq!(delivered, 1);
        assert!(receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_multi_device_delivery() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (phone, mut phone_rx) = ConnectionSender::channel();
        let (laptop, mut laptop_rx) = ConnectionSender::channel();

        registry.register(user, ConnectionId::new(), phone).await;
        registry.register(user, ConnectionId::new(), laptop).await;
        assert_eq!(registry.connection_count(user).await, 2);

        let delivered = registry.deliver_local(user, &typing_event()).await;
        assert_eq!(delivered, 2);
        assert!(phone_rx.recv().await.is_some());
        assert!(laptop_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unregister_removes_only_that_connection() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        let (sender_a, _rx_a) = ConnectionSender::channel();
        let (sender_b, _rx_b) = ConnectionSender::channel();

        registry.register(user, first, sender_a).await;
        registry.register(user, second, sender_b).await;

        registry.unregister(user, first).await;
        assert!(registry.has_connection(user).await);
        assert_eq!(registry.connection_count(user).await, 1);

        registry.unregister(user, second).await;
        assert!(!registry.has_connection(user).await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        // Must not panic or error; disconnect races are expected.
        registry.unregister(UserId::new(), ConnectionId::new()).await;
    }

    #[tokio::test]
    async fn test_presence_change_on_empty_transition() {
        let registry = ConnectionRegistry::new();
        let mut presence = registry.subscribe_presence();
        let user = UserId::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        let (sender_a, _rx_a) = ConnectionSender::channel();
        let (sender_b, _rx_b) = ConnectionSender::channel();

        registry.register(user, first, sender_a).await;
        let change = presence.recv().await.unwrap();
        assert_eq!(
            change,
            PresenceChange {
                user_id: user,
                online: true
            }
        );

        // Second device: no transition.
        registry.register(user, second, sender_b).await;
        registry.unregister(user, first).await;
        assert!(presence.try_recv().is_err());

        // Last device gone: offline.
        registry.unregister(user, second).await;
        let change = presence.recv().await.unwrap();
        assert_eq!(
            change,
            PresenceChange {
                user_id: user,
                online: false
            }
        );
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_user_drops() {
        let registry = ConnectionRegistry::new();
        let delivered = registry.deliver_local(UserId::new(), &typing_event()).await;
        assert_eq!(delivered, 0);
    }
}
