//! Media transport provider port.
//!
//! The media service actually carries audio/video; this core only
//! orchestrates admission. Two operations matter here: issuing short-lived
//! room credentials scoped to (room, identity), and a room-roster query
//! used as a presence fallback for users connected only to a media room.
//!
//! # Security
//!
//! - Requests authenticate with this service's token
//! - Timeouts prevent hanging connections
//! - Provider errors are logged server-side, surfaced as `Unavailable`

use crate::errors::CoreError;
use async_trait::async_trait;
use common::events::RoomCredential;
use common::types::UserId;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument};

/// Default timeout for media provider requests in seconds.
const MEDIA_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Port to the media transport provider.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Issue a short-lived admission credential for one identity in a room.
    async fn issue_credential(
        &self,
        room: &str,
        identity: UserId,
        can_publish: bool,
    ) -> Result<RoomCredential, CoreError>;

    /// Whether the user is currently present in any media room.
    async fn has_active_participant(&self, user_id: UserId) -> Result<bool, CoreError>;
}

#[derive(Debug, Serialize)]
struct CredentialRequest {
    room: String,
    identity: UserId,
    can_publish: bool,
}

#[derive(Debug, Deserialize)]
struct RosterResponse {
    present: bool,
}

/// HTTP client for the media provider's internal API.
#[derive(Clone)]
pub struct HttpMediaProvider {
    client: Client,
    base_url: String,
    service_token: String,
}

impl HttpMediaProvider {
    /// Create a media provider client.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String, service_token: String) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(MEDIA_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "rt.media", error = %e, "Failed to build HTTP client");
                CoreError::Internal
            })?;

        Ok(Self {
            client,
            base_url,
            service_token,
        })
    }
}

#[async_trait]
impl MediaProvider for HttpMediaProvider {
    #[instrument(skip(self), fields(room = %room, identity = %identity))]
    async fn issue_credential(
        &self,
        room: &str,
        identity: UserId,
        can_publish: bool,
    ) -> Result<RoomCredential, CoreError> {
        let url = format!("{}/internal/rooms/credentials", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .json(&CredentialRequest {
                room: room.to_string(),
                identity,
                can_publish,
            })
            .send()
            .await
            .map_err(|e| {
                error!(target: "rt.media", error = %e, "Credential request failed");
                CoreError::Unavailable("media provider unreachable".to_string())
            })?;

        if !response.status().is_success() {
            error!(
                target: "rt.media",
                status = %response.status(),
                "Media provider rejected credential request"
            );
            return Err(CoreError::Unavailable(
                "media provider rejected request".to_string(),
            ));
        }

        response.json::<RoomCredential>().await.map_err(|e| {
            error!(target: "rt.media", error = %e, "Malformed credential response");
            CoreError::Unavailable("malformed media provider response".to_string())
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn has_active_participant(&self, user_id: UserId) -> Result<bool, CoreError> {
        let url = format!("{}/internal/rooms/roster/{user_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(|e| {
                error!(target: "rt.media", error = %e, "Roster query failed");
                CoreError::Unavailable("media provider unreachable".to_string())
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Unavailable(
                "media provider rejected roster query".to_string(),
            ));
        }

        let roster: RosterResponse = response.json().await.map_err(|e| {
            error!(target: "rt.media", error = %e, "Malformed roster response");
            CoreError::Unavailable("malformed media provider response".to_string())
        })?;

        Ok(roster.present)
    }
}

/// Mock media provider for testing.
pub mod mock {
    use super::{CoreError, MediaProvider, RoomCredential, UserId};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Mock provider with a settable room roster.
    #[derive(Default)]
    pub struct MockMediaProvider {
        present: Mutex<HashSet<UserId>>,
        failing: bool,
    }

    impl MockMediaProvider {
        /// A provider with an empty roster.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A provider whose every call fails with `Unavailable`.
        #[must_use]
        pub fn failing() -> Self {
            Self {
                present: Mutex::new(HashSet::new()),
                failing: true,
            }
        }

        /// Mark a user as present in a media room.
        pub fn set_present(&self, user_id: UserId) {
            if let Ok(mut present) = self.present.lock() {
                present.insert(user_id);
            }
        }

        /// Remove a user from the roster.
        pub fn set_absent(&self, user_id: UserId) {
            if let Ok(mut present) = self.present.lock() {
                present.remove(&user_id);
            }
        }
    }

    #[async_trait]
    impl MediaProvider for MockMediaProvider {
        async fn issue_credential(
            &self,
            room: &str,
            identity: UserId,
            can_publish: bool,
        ) -> Result<RoomCredential, CoreError> {
            if self.failing {
                return Err(CoreError::Unavailable("mock media failure".to_string()));
            }
            Ok(RoomCredential {
                room: room.to_string(),
                token: format!("mock-token-{identity}"),
                can_publish,
                expires_at: Utc::now() + Duration::minutes(15),
            })
        }

        async fn has_active_participant(&self, user_id: UserId) -> Result<bool, CoreError> {
            if self.failing {
                return Err(CoreError::Unavailable("mock media failure".to_string()));
            }
            Ok(self
                .present
                .lock()
                .map(|present| present.contains(&user_id))
                .unwrap_or(false))
        }
    }
}
