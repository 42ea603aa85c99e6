//! Business services.
//!
//! Each service validates capabilities, applies a conditional write
//! through its store port, and only then emits best-effort fan-out
//! events. A failed notification never rolls back a persisted transition.

pub mod calls;
pub mod fulfillment;
pub mod messaging;
