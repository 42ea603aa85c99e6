//! Common vocabulary shared across Fanline realtime components.

#![warn(clippy::pedantic)]

/// Module for typed entity identifiers
pub mod types;

/// Module for participant capability tags
pub mod capabilities;

/// Module for realtime event envelopes
pub mod events;
