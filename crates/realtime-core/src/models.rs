//! Persisted entity models.
//!
//! These records live in storage and are mutated only through the
//! conditional updates exposed by `store`. In-memory copies are plain
//! values; holding one confers no ownership of the underlying row.

use chrono::{DateTime, Utc};
use common::events::{CallKind, MessageKind};
use common::types::{CallId, ConversationId, MessageId, OrderId, UserId};
use serde::{Deserialize, Serialize};

/// Status of a call session.
///
/// `Rejected` and `Ended` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "accepted" => Some(CallStatus::Accepted),
            "rejected" => Some(CallStatus::Rejected),
            "ended" => Some(CallStatus::Ended),
            _ => None,
        }
    }

    /// Whether no further transition may leave this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }
}

/// A call session between a caller and a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub kind: CallKind,
    pub status: CallStatus,
    /// Stamped when the receiver accepts.
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped on reject or end.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock delta `ended_at - started_at`; present only if the call
    /// was ever accepted.
    pub duration_seconds: Option<i64>,
    /// Media room both parties are admitted to. A conversation may share
    /// this identifier; the mapping is a lookup, not ownership.
    pub room: String,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Whether the given user is one of the two participants.
    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        self.caller_id == user || self.receiver_id == user
    }

    /// The other participant, if `user` is a participant at all.
    #[must_use]
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        if user == self.caller_id {
            Some(self.receiver_id)
        } else if user == self.receiver_id {
            Some(self.caller_id)
        } else {
            None
        }
    }
}

/// A conversation between a creator and a fan, unique per pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub creator_id: UserId,
    pub fan_id: UserId,
    /// Gates whether the fan may send. Creator-initiated conversations are
    /// enabled immediately; fan-initiated ones await creator enablement.
    pub enabled: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    /// Service order this conversation fulfills, if any.
    pub linked_order_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether the given user is one of the two participants.
    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        self.creator_id == user || self.fan_id == user
    }

    /// The other participant, if `user` is a participant at all.
    #[must_use]
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        if user == self.creator_id {
            Some(self.fan_id)
        } else if user == self.fan_id {
            Some(self.creator_id)
        } else {
            None
        }
    }
}

/// A message within a conversation. Append-only; only `read_at` mutates,
/// once, from null to a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Short text used for the conversation summary line.
    #[must_use]
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => {
                let content = self.content.as_deref().unwrap_or_default();
                content.chars().take(80).collect()
            }
            MessageKind::Image => "[image]".to_string(),
            MessageKind::Audio => "[audio]".to_string(),
            MessageKind::Video => "[video]".to_string(),
        }
    }
}

/// Status of a service order, as far as this core cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Active => "active",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(OrderStatus::Active),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// A service order requiring synchronous participation (chat/call-type
/// purchase). Owned by the fulfillment subsystem elsewhere; this core only
/// reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: OrderId,
    pub creator_id: UserId,
    pub fan_id: UserId,
    pub status: OrderStatus,
}

/// The bounded-time window in which both parties of a service order must
/// join. `expires_at` is fixed at creation and never extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentWindow {
    pub order_id: OrderId,
    pub creator_id: UserId,
    pub fan_id: UserId,
    pub conversation_id: ConversationId,
    pub expires_at: DateTime<Utc>,
    pub creator_joined_at: Option<DateTime<Utc>>,
    pub fan_joined_at: Option<DateTime<Utc>>,
}

impl FulfillmentWindow {
    /// Lazy expiry check; there is no background sweep.
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Both join timestamps present, regardless of order or lateness.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.creator_joined_at.is_some() && self.fan_joined_at.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_call_status_roundtrip() {
        for status in [
            CallStatus::Initiated,
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Rejected,
            CallStatus::Ended,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CallStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_counterpart_lookup() {
        let caller = UserId::new();
        let receiver = UserId::new();
        let call = CallSession {
            id: CallId::new(),
            caller_id: caller,
            receiver_id: receiver,
            kind: CallKind::Audio,
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            room: "room-1".to_string(),
            created_at: Utc::now(),
        };

        assert_eq!(call.counterpart(caller), Some(receiver));
        assert_eq!(call.counterpart(receiver), Some(caller));
        assert_eq!(call.counterpart(UserId::new()), None);
        assert!(!call.is_participant(UserId::new()));
    }

    #[test]
    fn test_message_preview_truncates_text() {
        let long = "x".repeat(200);
        let message = Message {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: UserId::new(),
            kind: MessageKind::Text,
            content: Some(long),
            media_url: None,
            created_at: Utc::now(),
            read_at: None,
        };
        assert_eq!(message.preview().chars().count(), 80);
    }

    #[test]
    fn test_media_message_preview_placeholder() {
        let message = Message {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: UserId::new(),
            kind: MessageKind::Image,
            content: None,
            media_url: Some("https://cdn/x.png".to_string()),
            created_at: Utc::now(),
            read_at: None,
        };
        assert_eq!(message.preview(), "[image]");
    }

    #[test]
    fn test_window_open_and_satisfied() {
        let now = Utc::now();
        let mut window = FulfillmentWindow {
            order_id: OrderId::new(),
            creator_id: UserId::new(),
            fan_id: UserId::new(),
            conversation_id: ConversationId::new(),
            expires_at: now + Duration::seconds(30),
            creator_joined_at: Some(now),
            fan_joined_at: None,
        };

        assert!(window.is_open(now + Duration::seconds(29)));
        assert!(!window.is_open(now + Duration::seconds(30)));
        assert!(!window.is_satisfied());

        // A join after expiry still satisfies the window.
        window.fan_joined_at = Some(now + Duration::seconds(31));
        assert!(window.is_satisfied());
        assert!(!window.is_open(now + Duration::seconds(32)));
    }
}
