//! Fulfillment windows for synchronous service orders.
//!
//! When a creator starts fulfilling an order, both parties must be online
//! and a fixed-length window opens. The creator's join is stamped at start;
//! the fan is expected to join before `expires_at`. Expiry is evaluated
//! lazily at read time, there is no background sweep, and a join is never
//! refused for lateness: the stamp is recorded and the window simply reads
//! as expired-unsatisfied or late-satisfied depending on when it is asked.

use crate::errors::CoreError;
use crate::models::{FulfillmentWindow, OrderStatus};
use crate::notify::NotificationDispatch;
use crate::presence::PresenceTracker;
use crate::router::EventSink;
use crate::store::{ConversationStore, WindowSide, WindowStore};
use chrono::{Duration, Utc};
use common::capabilities::{Capability, CapabilitySet};
use common::events::{EventEnvelope, RealtimeEvent};
use common::types::{ConversationId, OrderId, UserId};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Point-in-time view of a window, resolved lazily against the clock.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStatus {
    pub window: FulfillmentWindow,
    /// Still before `expires_at`.
    pub open: bool,
    /// Both parties have joined, regardless of when.
    pub satisfied: bool,
}

/// The fulfillment window service.
pub struct FulfillmentWindows {
    windows: Arc<dyn WindowStore>,
    conversations: Arc<dyn ConversationStore>,
    presence: Arc<PresenceTracker>,
    sink: Arc<dyn EventSink>,
    notify: Arc<dyn NotificationDispatch>,
    window: Duration,
}

impl FulfillmentWindows {
    /// Wire up the service with the configured window length.
    pub fn new(
        windows: Arc<dyn WindowStore>,
        conversations: Arc<dyn ConversationStore>,
        presence: Arc<PresenceTracker>,
        sink: Arc<dyn EventSink>,
        notify: Arc<dyn NotificationDispatch>,
        window_seconds: i64,
    ) -> Self {
        Self {
            windows,
            conversations,
            presence,
            sink,
            notify,
            window: Duration::seconds(window_seconds),
        }
    }

    /// Open the fulfillment window for an order. Creator only.
    ///
    /// Preconditions checked in order: the actor is the order's creator,
    /// the order is still active, no window exists yet, and both parties
    /// are online right now. Presence uses the strict query: if liveness
    /// cannot be determined the start fails `Unavailable` rather than
    /// guessing.
    #[instrument(skip_all, fields(order_id = %order_id, actor = %caps.actor()))]
    pub async fn start(
        &self,
        caps: &CapabilitySet,
        order_id: OrderId,
    ) -> Result<FulfillmentWindow, CoreError> {
        let order = self
            .windows
            .get_order(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("order".to_string()))?;

        if caps.actor() != order.creator_id || !caps.has(Capability::CreatorOf) {
            return Err(CoreError::Forbidden(
                "only the order's creator may start fulfillment".to_string(),
            ));
        }
        if order.status != OrderStatus::Active {
            return Err(CoreError::InvalidState(format!(
                "order is {}",
                order.status.as_str()
            )));
        }
        if self.windows.get_window(order_id).await?.is_some() {
            return Err(CoreError::InvalidState(
                "fulfillment already started".to_string(),
            ));
        }

        if !self.presence.is_online_strict(order.creator_id).await? {
            return Err(CoreError::PreconditionFailed(
                "creator is not online".to_string(),
            ));
        }
        if !self.presence.is_online_strict(order.fan_id).await? {
            return Err(CoreError::PreconditionFailed(
                "fan is not online".to_string(),
            ));
        }

        // Fulfillment happens inside the pair's conversation; create it if
        // the pair never talked before.
        let conversation_id = match self
            .conversations
            .find_by_pair(order.creator_id, order.fan_id)
            .await?
        {
            Some(conversation) => conversation.id,
            None => {
                let candidate = crate::models::Conversation {
                    id: ConversationId::new(),
                    creator_id: order.creator_id,
                    fan_id: order.fan_id,
                    enabled: true,
                    last_message_at: None,
                    last_message_preview: None,
                    linked_order_id: None,
                    created_at: Utc::now(),
                };
                // A racing open for the pair may win; use whichever row
                // survived.
                self.conversations.create_conversation(&candidate).await?.id
            }
        };
        self.conversations
            .set_linked_order(conversation_id, order_id)
            .await?;

        let now = Utc::now();
        let window = FulfillmentWindow {
            order_id,
            creator_id: order.creator_id,
            fan_id: order.fan_id,
            conversation_id,
            expires_at: now + self.window,
            // Starting is the creator's join.
            creator_joined_at: Some(now),
            fan_joined_at: None,
        };
        self.windows.create_window(&window).await?;

        info!(
            target: "rt.fulfillment",
            order_id = %order_id,
            expires_at = %window.expires_at,
            "Fulfillment window opened"
        );

        let envelope = EventEnvelope::now(RealtimeEvent::WindowOpened {
            order_id,
            conversation_id,
            expires_at: window.expires_at,
        });
        self.sink.send_to_user(order.fan_id, envelope.clone()).await;
        if let Err(e) = self.notify.deliver(order.fan_id, &envelope).await {
            warn!(target: "rt.fulfillment", order_id = %order_id, error = %e, "Window push failed");
        }

        Ok(window)
    }

    /// Record a party's join. Participant only; first join per side wins.
    ///
    /// A late join is still recorded. Whether it counts is a question for
    /// whoever reads the window afterwards, not for this operation.
    #[instrument(skip_all, fields(order_id = %order_id, actor = %caps.actor()))]
    pub async fn join(
        &self,
        caps: &CapabilitySet,
        order_id: OrderId,
    ) -> Result<FulfillmentWindow, CoreError> {
        let window = self
            .windows
            .get_window(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("fulfillment window".to_string()))?;

        let side = self.side_of(&window, caps.actor())?;
        let updated = self
            .windows
            .stamp_join(order_id, side, Utc::now())
            .await?
            .ok_or_else(|| CoreError::NotFound("fulfillment window".to_string()))?;

        info!(
            target: "rt.fulfillment",
            order_id = %order_id,
            satisfied = updated.is_satisfied(),
            "Fulfillment join recorded"
        );

        Ok(updated)
    }

    /// Lazy status read: openness is computed against the clock at call
    /// time. Participant only.
    #[instrument(skip_all, fields(order_id = %order_id, actor = %caps.actor()))]
    pub async fn status(
        &self,
        caps: &CapabilitySet,
        order_id: OrderId,
    ) -> Result<WindowStatus, CoreError> {
        let window = self
            .windows
            .get_window(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("fulfillment window".to_string()))?;
        self.side_of(&window, caps.actor())?;

        let now = Utc::now();
        Ok(WindowStatus {
            open: window.is_open(now),
            satisfied: window.is_satisfied(),
            window,
        })
    }

    fn side_of(&self, window: &FulfillmentWindow, actor: UserId) -> Result<WindowSide, CoreError> {
        if actor == window.creator_id {
            Ok(WindowSide::Creator)
        } else if actor == window.fan_id {
            Ok(WindowSide::Fan)
        } else {
            Err(CoreError::Forbidden(
                "not a party of this order".to_string(),
            ))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaProvider;
    use crate::media::MediaProvider;
    use crate::models::ServiceOrder;
    use crate::notify::mock::MockNotificationDispatch;
    use crate::registry::ConnectionRegistry;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        sent: Mutex<Vec<(UserId, EventEnvelope)>>,
    }

    impl CollectingSink {
        fn events_for(&self, user: UserId) -> Vec<RealtimeEvent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(target, _)| *target == user)
                .map(|(_, envelope)| envelope.event.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn send_to_user(&self, user_id: UserId, envelope: EventEnvelope) {
            self.sent.lock().unwrap().push((user_id, envelope));
        }
    }

    struct Harness {
        service: FulfillmentWindows,
        store: MemoryStore,
        media: Arc<MockMediaProvider>,
        sink: Arc<CollectingSink>,
    }

    fn harness(window_seconds: i64) -> Harness {
        let store = MemoryStore::new();
        let sink = Arc::new(CollectingSink::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let media = Arc::new(MockMediaProvider::new());
        let presence = Arc::new(PresenceTracker::new(
            registry,
            Arc::clone(&media) as Arc<dyn MediaProvider>,
        ));
        let service = FulfillmentWindows::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            presence,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::new(MockNotificationDispatch::new()),
            window_seconds,
        );
        Harness {
            service,
            store,
            media,
            sink,
        }
    }

    async fn seeded_order(h: &Harness, status: OrderStatus) -> ServiceOrder {
        let order = ServiceOrder {
            id: OrderId::new(),
            creator_id: UserId::new(),
            fan_id: UserId::new(),
            status,
        };
        h.store.insert_order(order.clone()).await;
        order
    }

    #[tokio::test]
    async fn test_start_opens_window_with_creator_stamped() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);

        let window = h
            .service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();

        assert!(window.creator_joined_at.is_some());
        assert!(window.fan_joined_at.is_none());
        assert!(!window.is_satisfied());

        let delta = window.expires_at - window.creator_joined_at.unwrap();
        assert_eq!(delta.num_seconds(), 30);

        // Fan is notified where to go and by when.
        let events = h.sink.events_for(order.fan_id);
        assert!(events.iter().any(|e| matches!(
            e,
            RealtimeEvent::WindowOpened { order_id, .. } if *order_id == order.id
        )));
    }

    #[tokio::test]
    async fn test_start_requires_both_online() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        let creator_caps = CapabilitySet::creator(order.creator_id);

        h.media.set_present(order.creator_id);
        let err = h.service.start(&creator_caps, order.id).await.unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");

        h.media.set_present(order.fan_id);
        h.service.start(&creator_caps, order.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_creator_only() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);

        let err = h
            .service
            .start(&CapabilitySet::participant(order.fan_id), order.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        // Holding CreatorOf for someone else's order does not help.
        let err = h
            .service
            .start(&CapabilitySet::creator(UserId::new()), order.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_start_refuses_inactive_order_and_double_start() {
        let h = harness(30);
        let cancelled = seeded_order(&h, OrderStatus::Cancelled).await;
        h.media.set_present(cancelled.creator_id);
        h.media.set_present(cancelled.fan_id);

        let err = h
            .service
            .start(&CapabilitySet::creator(cancelled.creator_id), cancelled.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);
        let creator_caps = CapabilitySet::creator(order.creator_id);

        h.service.start(&creator_caps, order.id).await.unwrap();
        let err = h.service.start(&creator_caps, order.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_presence_outage_fails_start_unavailable() {
        let store = MemoryStore::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let media = Arc::new(MockMediaProvider::failing());
        let presence = Arc::new(PresenceTracker::new(
            registry,
            media as Arc<dyn MediaProvider>,
        ));
        let service = FulfillmentWindows::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            presence,
            Arc::new(CollectingSink::default()),
            Arc::new(MockNotificationDispatch::new()),
            30,
        );

        let order = ServiceOrder {
            id: OrderId::new(),
            creator_id: UserId::new(),
            fan_id: UserId::new(),
            status: OrderStatus::Active,
        };
        store.insert_order(order.clone()).await;

        let err = service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_fan_join_satisfies_window() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);

        h.service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();
        let window = h
            .service
            .join(&CapabilitySet::participant(order.fan_id), order.id)
            .await
            .unwrap();

        assert!(window.is_satisfied());

        let status = h
            .service
            .status(&CapabilitySet::participant(order.fan_id), order.id)
            .await
            .unwrap();
        assert!(status.open);
        assert!(status.satisfied);
    }

    #[tokio::test]
    async fn test_repeat_join_keeps_first_stamp() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);
        let fan_caps = CapabilitySet::participant(order.fan_id);

        h.service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();
        let first = h.service.join(&fan_caps, order.id).await.unwrap();
        let second = h.service.join(&fan_caps, order.id).await.unwrap();

        assert_eq!(first.fan_joined_at, second.fan_joined_at);
    }

    #[tokio::test]
    async fn test_late_join_recorded_on_expired_window() {
        // A zero-length window expires immediately.
        let h = harness(0);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);

        h.service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();

        let window = h
            .service
            .join(&CapabilitySet::participant(order.fan_id), order.id)
            .await
            .unwrap();
        // The late stamp lands; the window just reads as closed.
        assert!(window.fan_joined_at.is_some());
        assert!(window.is_satisfied());

        let status = h
            .service
            .status(&CapabilitySet::participant(order.fan_id), order.id)
            .await
            .unwrap();
        assert!(!status.open);
        assert!(status.satisfied);
    }

    #[tokio::test]
    async fn test_outsider_cannot_join_or_read() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);
        let outsider = CapabilitySet::participant(UserId::new());

        h.service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();

        let err = h.service.join(&outsider, order.id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        let err = h.service.status(&outsider, order.id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_start_reuses_existing_conversation() {
        let h = harness(30);
        let order = seeded_order(&h, OrderStatus::Active).await;
        h.media.set_present(order.creator_id);
        h.media.set_present(order.fan_id);

        let existing = crate::models::Conversation {
            id: ConversationId::new(),
            creator_id: order.creator_id,
            fan_id: order.fan_id,
            enabled: true,
            last_message_at: None,
            last_message_preview: None,
            linked_order_id: None,
            created_at: Utc::now(),
        };
        h.store.create_conversation(&existing).await.unwrap();

        let window = h
            .service
            .start(&CapabilitySet::creator(order.creator_id), order.id)
            .await
            .unwrap();

        assert_eq!(window.conversation_id, existing.id);
        let linked = h
            .store
            .get_conversation(existing.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.linked_order_id, Some(order.id));
    }
}
