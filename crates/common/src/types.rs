//! Typed identifiers for Fanline entities.
//!
//! Each identifier is a newtype over `Uuid` so that a conversation id can
//! never be passed where a call id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

entity_id! {
    /// Unique identifier for a platform user (creator or fan).
    UserId
}

entity_id! {
    /// Unique identifier for one live transport connection.
    ///
    /// A user with several devices holds several connection ids.
    ConnectionId
}

entity_id! {
    /// Unique identifier for a conversation between a creator and a fan.
    ConversationId
}

entity_id! {
    /// Unique identifier for a message within a conversation.
    MessageId
}

entity_id! {
    /// Unique identifier for a call session.
    CallId
}

entity_id! {
    /// Unique identifier for a service order.
    OrderId
}
