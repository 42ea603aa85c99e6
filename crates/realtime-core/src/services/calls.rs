//! Call signaling state machine.
//!
//! Lifecycle: initiate -> ring -> accept/reject -> end. Every transition
//! is a read-then-conditional-write against persisted status: the handler
//! loads the current status, checks it against the allowed source set, and
//! guards the write with the value it read. Two racing transitions are
//! safe because the loser observes the already-updated status and fails
//! the guard. `ended` and `rejected` are terminal.
//!
//! Side effects (notifying the counterpart, issuing room credentials to
//! the caller) fire only after the write succeeds and never roll it back;
//! signaling is best-effort, persisted state is authoritative.

use crate::errors::CoreError;
use crate::media::MediaProvider;
use crate::models::{CallSession, CallStatus};
use crate::notify::NotificationDispatch;
use crate::presence::PresenceTracker;
use crate::router::EventSink;
use crate::store::{CallPatch, CallStore};
use chrono::Utc;
use common::capabilities::CapabilitySet;
use common::events::{CallKind, EventEnvelope, RealtimeEvent, RoomCredential};
use common::types::{CallId, UserId};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Source statuses from which a call may be accepted or rejected.
const ANSWERABLE: &[CallStatus] = &[CallStatus::Initiated, CallStatus::Ringing];

/// Source statuses from which a call may be ended.
const ENDABLE: &[CallStatus] = &[CallStatus::Initiated, CallStatus::Ringing, CallStatus::Accepted];

/// Result of a successful accept: the updated session plus the receiver's
/// own room credential. The caller's credential travels in the
/// `CallAccepted` event.
#[derive(Debug, Clone)]
pub struct AcceptResult {
    pub call: CallSession,
    pub credential: RoomCredential,
}

/// The call signaling service.
pub struct CallSignaling {
    store: Arc<dyn CallStore>,
    sink: Arc<dyn EventSink>,
    media: Arc<dyn MediaProvider>,
    presence: Arc<PresenceTracker>,
    notify: Arc<dyn NotificationDispatch>,
}

impl CallSignaling {
    /// Wire up the service.
    pub fn new(
        store: Arc<dyn CallStore>,
        sink: Arc<dyn EventSink>,
        media: Arc<dyn MediaProvider>,
        presence: Arc<PresenceTracker>,
        notify: Arc<dyn NotificationDispatch>,
    ) -> Self {
        Self {
            store,
            sink,
            media,
            presence,
            notify,
        }
    }

    /// Start a call toward a receiver.
    ///
    /// The session is persisted ringing even if the receiver is offline;
    /// an offline receiver additionally gets a push notification so the
    /// ring survives until reconnect.
    #[instrument(skip_all, fields(caller_id = %caps.actor(), receiver_id = %receiver_id))]
    pub async fn initiate(
        &self,
        caps: &CapabilitySet,
        receiver_id: UserId,
        kind: CallKind,
    ) -> Result<CallSession, CoreError> {
        let caller_id = caps.actor();
        if caller_id == receiver_id {
            return Err(CoreError::Forbidden("cannot call yourself".to_string()));
        }

        let id = CallId::new();
        let call = CallSession {
            id,
            caller_id,
            receiver_id,
            kind,
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            room: format!("call-{id}"),
            created_at: Utc::now(),
        };

        self.store.create_call(&call).await?;

        info!(
            target: "rt.calls",
            call_id = %call.id,
            kind = kind.as_str(),
            "Call initiated"
        );

        let envelope = EventEnvelope::now(RealtimeEvent::CallRinging {
            call_id: call.id,
            caller_id,
            kind,
            room: call.room.clone(),
        });
        self.sink.send_to_user(receiver_id, envelope.clone()).await;

        if !self.presence.is_online(receiver_id).await {
            if let Err(e) = self.notify.deliver(receiver_id, &envelope).await {
                warn!(target: "rt.calls", call_id = %call.id, error = %e, "Ring push failed");
            }
        }

        Ok(call)
    }

    /// Accept a ringing call. Receiver only.
    ///
    /// Stamps `started_at`, returns the receiver's room credential, and
    /// notifies the caller with its own credential.
    #[instrument(skip_all, fields(call_id = %call_id, actor = %caps.actor()))]
    pub async fn accept(
        &self,
        caps: &CapabilitySet,
        call_id: CallId,
    ) -> Result<AcceptResult, CoreError> {
        let call = self.load(call_id).await?;
        self.require_receiver(&call, caps.actor())?;
        Self::require_status(&call, ANSWERABLE)?;

        // Issue credentials before the write so a media outage leaves the
        // call untouched (no partial state).
        let receiver_credential = self
            .media
            .issue_credential(&call.room, call.receiver_id, true)
            .await?;
        let caller_credential = self
            .media
            .issue_credential(&call.room, call.caller_id, true)
            .await?;

        let updated = self
            .store
            .transition_call(
                call_id,
                &[call.status],
                CallPatch {
                    status: CallStatus::Accepted,
                    started_at: Some(Utc::now()),
                    ended_at: None,
                    duration_seconds: None,
                },
            )
            .await?
            .ok_or_else(|| CoreError::InvalidState("call state changed".to_string()))?;

        info!(target: "rt.calls", call_id = %call_id, "Call accepted");

        self.sink
            .send_to_user(
                updated.caller_id,
                EventEnvelope::now(RealtimeEvent::CallAccepted {
                    call_id,
                    credential: caller_credential,
                }),
            )
            .await;

        Ok(AcceptResult {
            call: updated,
            credential: receiver_credential,
        })
    }

    /// Reject a ringing call. Receiver only.
    #[instrument(skip_all, fields(call_id = %call_id, actor = %caps.actor()))]
    pub async fn reject(
        &self,
        caps: &CapabilitySet,
        call_id: CallId,
    ) -> Result<CallSession, CoreError> {
        let call = self.load(call_id).await?;
        self.require_receiver(&call, caps.actor())?;
        Self::require_status(&call, ANSWERABLE)?;

        let updated = self
            .store
            .transition_call(
                call_id,
                &[call.status],
                CallPatch {
                    status: CallStatus::Rejected,
                    started_at: None,
                    ended_at: Some(Utc::now()),
                    duration_seconds: None,
                },
            )
            .await?
            .ok_or_else(|| CoreError::InvalidState("call state changed".to_string()))?;

        info!(target: "rt.calls", call_id = %call_id, "Call rejected");

        self.sink
            .send_to_user(
                updated.caller_id,
                EventEnvelope::now(RealtimeEvent::CallRejected { call_id }),
            )
            .await;

        Ok(updated)
    }

    /// End a call. Either participant.
    ///
    /// Duration is the wall-clock delta from `started_at` and exists only
    /// if the call was ever accepted. A call that was never accepted ends
    /// with a null duration. Ended and rejected calls cannot be ended
    /// again; the second caller sees `InvalidState`.
    #[instrument(skip_all, fields(call_id = %call_id, actor = %caps.actor()))]
    pub async fn end(
        &self,
        caps: &CapabilitySet,
        call_id: CallId,
    ) -> Result<CallSession, CoreError> {
        let call = self.load(call_id).await?;
        let counterpart = call
            .counterpart(caps.actor())
            .ok_or_else(|| CoreError::Forbidden("not a participant of this call".to_string()))?;
        Self::require_status(&call, ENDABLE)?;

        let ended_at = Utc::now();
        let duration_seconds = match (call.status, call.started_at) {
            (CallStatus::Accepted, Some(started_at)) => {
                Some((ended_at - started_at).num_seconds())
            }
            _ => None,
        };

        let updated = self
            .store
            .transition_call(
                call_id,
                &[call.status],
                CallPatch {
                    status: CallStatus::Ended,
                    started_at: None,
                    ended_at: Some(ended_at),
                    duration_seconds,
                },
            )
            .await?
            .ok_or_else(|| CoreError::InvalidState("call state changed".to_string()))?;

        info!(
            target: "rt.calls",
            call_id = %call_id,
            duration_seconds = ?updated.duration_seconds,
            "Call ended"
        );

        self.sink
            .send_to_user(
                counterpart,
                EventEnvelope::now(RealtimeEvent::CallEnded {
                    call_id,
                    duration_seconds: updated.duration_seconds,
                }),
            )
            .await;

        Ok(updated)
    }

    async fn load(&self, call_id: CallId) -> Result<CallSession, CoreError> {
        self.store
            .get_call(call_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("call".to_string()))
    }

    fn require_receiver(&self, call: &CallSession, actor: UserId) -> Result<(), CoreError> {
        if !call.is_participant(actor) {
            return Err(CoreError::Forbidden(
                "not a participant of this call".to_string(),
            ));
        }
        if actor != call.receiver_id {
            return Err(CoreError::Forbidden(
                "only the receiver may answer".to_string(),
            ));
        }
        Ok(())
    }

    fn require_status(call: &CallSession, allowed: &[CallStatus]) -> Result<(), CoreError> {
        if allowed.contains(&call.status) {
            Ok(())
        } else if call.status.is_terminal() {
            Err(CoreError::InvalidState(format!(
                "call already {}",
                call.status.as_str()
            )))
        } else {
            Err(CoreError::InvalidState(format!(
                "call is {}",
                call.status.as_str()
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaProvider;
    use crate::notify::mock::MockNotificationDispatch;
    use crate::registry::{ConnectionRegistry, ConnectionSender};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use common::types::ConnectionId;
    use std::sync::Mutex;

    /// Sink that records every emitted event.
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
        service: CallSignaling,
        store: MemoryStore,
        sink: Arc<CollectingSink>,
        registry: Arc<ConnectionRegistry>,
        notify: Arc<MockNotificationDispatch>,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let sink = Arc::new(CollectingSink::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let media = Arc::new(MockMediaProvider::new());
        let notify = Arc::new(MockNotificationDispatch::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            Arc::clone(&media) as Arc<dyn MediaProvider>,
        ));
        let service = CallSignaling::new(
            Arc::new(store.clone()),
            Arc::clone(&sink) as Arc<dyn EventSink>,
            media,
            presence,
            Arc::clone(&notify) as Arc<dyn NotificationDispatch>,
        );
        Harness {
            service,
            store,
            sink,
            registry,
            notify,
        }
    }

    async fn connect(registry: &ConnectionRegistry, user: UserId) {
        let (sender, rx) = ConnectionSender::channel();
        registry.register(user, ConnectionId::new(), sender).await;
        // Keep the receiver alive for the duration of the test.
        std::mem::forget(rx);
    }

    #[tokio::test]
    async fn test_initiate_rings_receiver() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();
        connect(&h.registry, receiver).await;

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        assert_eq!(call.status, CallStatus::Ringing);
        assert!(call.started_at.is_none());

        let events = h.sink.events_for(receiver);
        assert!(matches!(events.as_slice(), [RealtimeEvent::CallRinging { .. }]));
        // Receiver was online: no push fallback.
        assert!(h.notify.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_to_offline_receiver_pushes() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        h.service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Video)
            .await
            .unwrap();

        let deliveries = h.notify.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, receiver);
    }

    #[tokio::test]
    async fn test_accept_stamps_started_and_credentials_both_parties() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        let result = h
            .service
            .accept(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap();

        assert_eq!(result.call.status, CallStatus::Accepted);
        assert!(result.call.started_at.is_some());
        assert_eq!(result.credential.room, call.room);

        // Caller's credential travels in the event.
        let events = h.sink.events_for(caller);
        assert!(events.iter().any(|e| matches!(
            e,
            RealtimeEvent::CallAccepted { call_id, credential }
                if *call_id == call.id && credential.room == call.room
        )));
    }

    #[tokio::test]
    async fn test_only_receiver_may_accept() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        let err = h
            .service
            .accept(&CapabilitySet::participant(caller), call.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let err = h
            .service
            .accept(&CapabilitySet::participant(UserId::new()), call.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_double_accept_is_invalid_state() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();
        let receiver_caps = CapabilitySet::participant(receiver);

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        h.service.accept(&receiver_caps, call.id).await.unwrap();
        let err = h.service.accept(&receiver_caps, call.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        // Status remains accepted.
        let stored = h.store.get_call(call.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Accepted);
    }

    #[tokio::test]
    async fn test_reject_notifies_caller_and_is_terminal() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        let rejected = h
            .service
            .reject(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap();
        assert_eq!(rejected.status, CallStatus::Rejected);
        assert!(rejected.ended_at.is_some());

        let events = h.sink.events_for(caller);
        assert!(events
            .iter()
            .any(|e| matches!(e, RealtimeEvent::CallRejected { .. })));

        // No transition leaves a terminal state.
        let err = h
            .service
            .end(&CapabilitySet::participant(caller), call.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_end_after_accept_computes_duration() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();
        h.service
            .accept(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap();

        let ended = h
            .service
            .end(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap();

        assert_eq!(ended.status, CallStatus::Ended);
        // Accepted and ended within the same test run: duration rounds to 0.
        assert_eq!(ended.duration_seconds, Some(0));

        let events = h.sink.events_for(caller);
        assert!(events.iter().any(|e| matches!(
            e,
            RealtimeEvent::CallEnded {
                duration_seconds: Some(_),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_duration_is_wall_clock_delta_from_accept() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        // Accepted 42 seconds ago: backdate the stamp directly in the store
        // so the end computes a real elapsed time.
        h.store
            .transition_call(
                call.id,
                &[CallStatus::Ringing],
                CallPatch {
                    status: CallStatus::Accepted,
                    started_at: Some(Utc::now() - chrono::Duration::seconds(42)),
                    ended_at: None,
                    duration_seconds: None,
                },
            )
            .await
            .unwrap()
            .unwrap();

        let ended = h
            .service
            .end(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap();

        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.duration_seconds, Some(42));

        let events = h.sink.events_for(caller);
        assert!(events.iter().any(|e| matches!(
            e,
            RealtimeEvent::CallEnded {
                duration_seconds: Some(42),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_end_without_accept_has_null_duration() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        // Caller hangs up before the receiver answers.
        let ended = h
            .service
            .end(&CapabilitySet::participant(caller), call.id)
            .await
            .unwrap();

        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.duration_seconds, None);
    }

    #[tokio::test]
    async fn test_second_end_is_invalid_state() {
        let h = harness();
        let caller = UserId::new();
        let receiver = UserId::new();

        let call = h
            .service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        h.service
            .end(&CapabilitySet::participant(caller), call.id)
            .await
            .unwrap();
        let err = h
            .service
            .end(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_media_outage_leaves_call_untouched() {
        let store = MemoryStore::new();
        let sink = Arc::new(CollectingSink::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let good_media = Arc::new(MockMediaProvider::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            Arc::clone(&good_media) as Arc<dyn MediaProvider>,
        ));
        let service = CallSignaling::new(
            Arc::new(store.clone()),
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::new(MockMediaProvider::failing()),
            presence,
            Arc::new(MockNotificationDispatch::new()),
        );

        let caller = UserId::new();
        let receiver = UserId::new();
        let call = service
            .initiate(&CapabilitySet::participant(caller), receiver, CallKind::Audio)
            .await
            .unwrap();

        let err = service
            .accept(&CapabilitySet::participant(receiver), call.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");

        // Not applied: the call still rings and can be accepted later.
        let stored = store.get_call(call.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let h = harness();
        let err = h
            .service
            .end(&CapabilitySet::participant(UserId::new()), CallId::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
