//! Store-and-forward push dispatch port.
//!
//! Used when a fan-out target has no live connection anywhere: the payload
//! goes to the push service for later delivery. Entirely decoupled from
//! the fan-out router and always best-effort; callers never fail an action
//! because a push could not be queued.

use crate::errors::CoreError;
use async_trait::async_trait;
use common::events::EventEnvelope;
use common::types::UserId;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, instrument};

/// Default timeout for push dispatch requests in seconds.
const PUSH_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Port to the push notification service.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    /// Queue a payload for later delivery to the user.
    async fn deliver(&self, user_id: UserId, envelope: &EventEnvelope) -> Result<(), CoreError>;
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    user_id: UserId,
    envelope: &'a EventEnvelope,
}

/// HTTP client for the push dispatch service.
#[derive(Clone)]
pub struct HttpNotificationDispatch {
    client: Client,
    base_url: String,
}

impl HttpNotificationDispatch {
    /// Create a push dispatch client.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(PUSH_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "rt.notify", error = %e, "Failed to build HTTP client");
                CoreError::Internal
            })?;

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl NotificationDispatch for HttpNotificationDispatch {
    #[instrument(skip(self, envelope), fields(user_id = %user_id))]
    async fn deliver(&self, user_id: UserId, envelope: &EventEnvelope) -> Result<(), CoreError> {
        let url = format!("{}/internal/push", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PushRequest { user_id, envelope })
            .send()
            .await
            .map_err(|e| {
                error!(target: "rt.notify", error = %e, "Push dispatch failed");
                CoreError::Unavailable("push service unreachable".to_string())
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Unavailable(
                "push service rejected request".to_string(),
            ));
        }

        Ok(())
    }
}

/// Mock push dispatch for testing.
pub mod mock {
    use super::{CoreError, EventEnvelope, NotificationDispatch, UserId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Mock dispatch that records every delivery.
    #[derive(Default)]
    pub struct MockNotificationDispatch {
        delivered: Mutex<Vec<(UserId, EventEnvelope)>>,
    }

    impl MockNotificationDispatch {
        /// An empty mock.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Deliveries recorded so far.
        pub fn deliveries(&self) -> Vec<(UserId, EventEnvelope)> {
            self.delivered
                .lock()
                .map(|delivered| delivered.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl NotificationDispatch for MockNotificationDispatch {
        async fn deliver(
            &self,
            user_id: UserId,
            envelope: &EventEnvelope,
        ) -> Result<(), CoreError> {
            if let Ok(mut delivered) = self.delivered.lock() {
                delivered.push((user_id, envelope.clone()));
            }
            Ok(())
        }
    }
}
