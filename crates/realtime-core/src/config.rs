//! Realtime core configuration.
//!
//! Configuration is loaded from environment variables. Connection URLs may
//! carry credentials and are redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP bind address for the health surface.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default fulfillment window length in seconds.
pub const DEFAULT_WINDOW_SECONDS: i64 = 30;

/// Default instance id prefix.
pub const DEFAULT_INSTANCE_PREFIX: &str = "rt";

/// Realtime core configuration.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Redis connection URL (fan-out broker).
    pub redis_url: String,

    /// Health/readiness server bind address.
    pub bind_address: String,

    /// Unique identifier for this process instance.
    /// Used by the router to skip re-delivering its own broker publishes.
    pub instance_id: String,

    /// Media provider base URL (room credentials, roster queries).
    pub media_base_url: String,

    /// Service token for the media provider.
    pub media_service_token: String,

    /// Push dispatch base URL (store-and-forward notifications).
    pub push_base_url: String,

    /// Fulfillment window length in seconds (fixed at window creation).
    pub window_seconds: i64,
}

/// Custom Debug implementation that redacts connection URLs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("instance_id", &self.instance_id)
            .field("media_base_url", &self.media_base_url)
            .field("media_service_token", &"[REDACTED]")
            .field("push_base_url", &self.push_base_url)
            .field("window_seconds", &self.window_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid fulfillment window configuration: {0}")]
    InvalidWindowSeconds(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
            .clone();

        let redis_url = vars
            .get("REDIS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
            .clone();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let instance_id = vars.get("INSTANCE_ID").cloned().unwrap_or_else(|| {
            format!("{}-{}", DEFAULT_INSTANCE_PREFIX, uuid::Uuid::new_v4())
        });

        let media_base_url = vars
            .get("MEDIA_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MEDIA_BASE_URL".to_string()))?
            .clone();

        let media_service_token = vars
            .get("MEDIA_SERVICE_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("MEDIA_SERVICE_TOKEN".to_string()))?
            .clone();

        let push_base_url = vars
            .get("PUSH_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("PUSH_BASE_URL".to_string()))?
            .clone();

        let window_seconds = match vars.get("WINDOW_SECONDS") {
            Some(raw) => {
                let parsed: i64 = raw.parse().map_err(|_| {
                    ConfigError::InvalidWindowSeconds(format!("not a number: {raw}"))
                })?;
                if parsed <= 0 {
                    return Err(ConfigError::InvalidWindowSeconds(
                        "must be positive".to_string(),
                    ));
                }
                parsed
            }
            None => DEFAULT_WINDOW_SECONDS,
        };

        Ok(Self {
            database_url,
            redis_url,
            bind_address,
            instance_id,
            media_base_url,
            media_service_token,
            push_base_url,
            window_seconds,
        })
    }
}
