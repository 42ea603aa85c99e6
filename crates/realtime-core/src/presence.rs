//! Derived online/offline queries.
//!
//! Presence is truth-by-construction, not a stored record: a user is
//! online iff the local registry holds a connection for them, or the media
//! provider's room roster does. Nothing is cached; every query recomputes.
//!
//! Within one process the registry answer is exact. When this process
//! holds no connection for the user, the media roster acts as the
//! cross-process liveness side-channel: a participant can be "present" for
//! call purposes while connected only to a media room.

use crate::errors::CoreError;
use crate::media::MediaProvider;
use crate::registry::{PresenceChange, SharedRegistry};
use crate::router::EventSink;
use common::events::{EventEnvelope, RealtimeEvent};
use common::types::UserId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Composed presence query over registry membership and the media roster.
pub struct PresenceTracker {
    registry: SharedRegistry,
    media: Arc<dyn MediaProvider>,
}

impl PresenceTracker {
    /// Create a tracker over an injected registry and media provider.
    pub fn new(registry: SharedRegistry, media: Arc<dyn MediaProvider>) -> Self {
        Self { registry, media }
    }

    /// Whether the user is reachable right now.
    ///
    /// The registry is consulted first; the roster query only runs when the
    /// local registry is empty for the user. A roster failure degrades to
    /// the registry answer rather than erroring the caller.
    pub async fn is_online(&self, user_id: UserId) -> bool {
        if self.registry.has_connection(user_id).await {
            return true;
        }

        match self.media.has_active_participant(user_id).await {
            Ok(present) => present,
            Err(e) => {
                debug!(
                    target: "rt.presence",
                    user_id = %user_id,
                    error = %e,
                    "Roster fallback unavailable, reporting offline"
                );
                false
            }
        }
    }

    /// Strict variant used where a precondition must not silently degrade:
    /// a roster failure is surfaced as `Unavailable` instead of `false`.
    pub async fn is_online_strict(&self, user_id: UserId) -> Result<bool, CoreError> {
        if self.registry.has_connection(user_id).await {
            return Ok(true);
        }
        self.media.has_active_participant(user_id).await
    }
}

/// Fan-out of registry presence transitions as `PresenceChanged` events.
///
/// The session layer registers who is watching whom (a client viewing a
/// conversation watches its counterpart); each empty<->non-empty registry
/// transition is forwarded to the target's current watchers through the
/// event sink, so the notification crosses instances like any other event.
pub struct PresenceFanout {
    watchers: RwLock<HashMap<UserId, HashSet<UserId>>>,
    sink: Arc<dyn EventSink>,
}

impl PresenceFanout {
    /// Create a fan-out with no watchers.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Start delivering `target`'s presence transitions to `watcher`.
    pub async fn watch(&self, watcher: UserId, target: UserId) {
        self.watchers
            .write()
            .await
            .entry(target)
            .or_default()
            .insert(watcher);
    }

    /// Stop watching. Unknown pairs are a no-op.
    pub async fn unwatch(&self, watcher: UserId, target: UserId) {
        let mut watchers = self.watchers.write().await;
        if let Some(set) = watchers.get_mut(&target) {
            set.remove(&watcher);
            if set.is_empty() {
                watchers.remove(&target);
            }
        }
    }

    /// Spawn the forwarding task over a registry presence subscription.
    ///
    /// Runs until cancelled. A lagged broadcast receiver skips the missed
    /// transitions; watchers re-sync on their next presence query.
    pub fn spawn(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<PresenceChange>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fanout = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(target: "rt.presence", "Presence fan-out cancelled");
                        break;
                    }
                    change = changes.recv() => {
                        match change {
                            Ok(change) => fanout.forward(change).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(
                                    target: "rt.presence",
                                    missed = missed,
                                    "Presence fan-out lagged, transitions dropped"
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    async fn forward(&self, change: PresenceChange) {
        let targets: Vec<UserId> = {
            let watchers = self.watchers.read().await;
            match watchers.get(&change.user_id) {
                Some(set) => set.iter().copied().collect(),
                None => return,
            }
        };

        for watcher in targets {
            self.sink
                .send_to_user(
                    watcher,
                    EventEnvelope::now(RealtimeEvent::PresenceChanged {
                        user_id: change.user_id,
                        online: change.online,
                    }),
                )
                .await;
        }
    }
}
