//! Participant capability tags.
//!
//! Authorization is resolved once per request into a `CapabilitySet` and
//! passed explicitly into service operations. Handlers never re-derive
//! roles from ad-hoc string comparisons.

use crate::types::UserId;
use serde::{Deserialize, Serialize};

/// A single capability held by the acting user for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// The actor is one of the two participants of the target entity.
    Participant,
    /// The actor is the creator side of the target entity.
    CreatorOf,
    /// Platform administrator.
    Admin,
}

/// The resolved identity and capabilities of the acting user.
///
/// Built by the request layer (out of scope here) and handed to services,
/// which only ever check membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    actor: UserId,
    capabilities: Vec<Capability>,
}

impl CapabilitySet {
    /// Build a capability set for an acting user.
    #[must_use]
    pub fn new(actor: UserId, capabilities: Vec<Capability>) -> Self {
        Self {
            actor,
            capabilities,
        }
    }

    /// The acting user.
    #[must_use]
    pub fn actor(&self) -> UserId {
        self.actor
    }

    /// Whether the actor holds the given capability.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Convenience constructor: a plain participant.
    #[must_use]
    pub fn participant(actor: UserId) -> Self {
        Self::new(actor, vec![Capability::Participant])
    }

    /// Convenience constructor: the creator side of the target entity.
    #[must_use]
    pub fn creator(actor: UserId) -> Self {
        Self::new(actor, vec![Capability::Participant, Capability::CreatorOf])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_lacks_creator_capability() {
        let caps = CapabilitySet::participant(UserId::new());
        assert!(caps.has(Capability::Participant));
        assert!(!caps.has(Capability::CreatorOf));
        assert!(!caps.has(Capability::Admin));
    }

    #[test]
    fn test_creator_is_also_participant() {
        let caps = CapabilitySet::creator(UserId::new());
        assert!(caps.has(Capability::Participant));
        assert!(caps.has(Capability::CreatorOf));
    }

    #[test]
    fn test_actor_is_preserved() {
        let user = UserId::new();
        let caps = CapabilitySet::participant(user);
        assert_eq!(caps.actor(), user);
    }
}
