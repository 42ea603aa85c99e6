//! Fanline Realtime Core
//!
//! The stateful core of the Fanline creator/fan platform: it tracks which
//! users are reachable right now, routes events to the correct live
//! connection wherever it is hosted, drives calls through a strict state
//! machine, and gates the timed fulfillment window in which both parties
//! of a service order must join.
//!
//! # Architecture
//!
//! ```text
//! services/*.rs  -> store/*.rs   (persisted state, conditional updates)
//!                -> router.rs    (best-effort fan-out, local + broker)
//!                -> presence.rs  (registry membership + media roster)
//! ```
//!
//! Persisted entity status is the only shared mutable resource; every
//! mutation goes through a conditional single-row update guarded by the
//! previously-read value. There are no cross-process locks.
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with stable code and HTTP status mapping
//! - `models` - Persisted entity models
//! - `registry` - Per-process connection registry
//! - `broker` - Publish/subscribe abstraction (Redis in production)
//! - `router` - Cross-instance fan-out router
//! - `presence` - Derived online/offline queries
//! - `media` - Media provider port (room credentials, roster fallback)
//! - `notify` - Store-and-forward push dispatch port
//! - `store` - Repository ports plus Postgres and in-memory backends
//! - `services` - Call signaling, message delivery, fulfillment windows
//! - `observability` - Liveness/readiness probes

pub mod broker;
pub mod config;
pub mod errors;
pub mod media;
pub mod models;
pub mod notify;
pub mod observability;
pub mod presence;
pub mod registry;
pub mod router;
pub mod services;
pub mod store;
