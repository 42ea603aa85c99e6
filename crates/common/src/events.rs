//! Realtime event envelopes.
//!
//! Everything the fan-out path delivers to a live connection is an
//! `EventEnvelope`: a tagged union plus the emission timestamp. The
//! serialized form always carries `type`, `timestamp`, and a `payload`
//! object specific to the type.

use crate::types::{CallId, ConversationId, MessageId, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of call being signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "audio" => Some(CallKind::Audio),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }
}

/// Kind of message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
}

impl MessageKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "audio" => Some(MessageKind::Audio),
            "video" => Some(MessageKind::Video),
            _ => None,
        }
    }
}

/// Short-lived admission credential for a media room.
///
/// Issued by the media provider, scoped to one (room, identity) pair.
/// This core orchestrates credentials; it never touches media itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCredential {
    /// Room the credential admits to.
    pub room: String,
    /// Opaque provider token.
    pub token: String,
    /// Whether the holder may publish media (vs subscribe only).
    pub can_publish: bool,
    /// Credential expiry.
    pub expires_at: DateTime<Utc>,
}

/// The realtime event union.
///
/// Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// An incoming call is ringing for the receiver.
    CallRinging {
        call_id: CallId,
        caller_id: UserId,
        kind: CallKind,
        room: String,
    },
    /// The receiver accepted; the caller gets its room credential here.
    CallAccepted {
        call_id: CallId,
        credential: RoomCredential,
    },
    /// The receiver rejected the call.
    CallRejected { call_id: CallId },
    /// The call ended. Duration is present only if it was ever accepted.
    CallEnded {
        call_id: CallId,
        duration_seconds: Option<i64>,
    },
    /// A new message was persisted in a conversation.
    MessageCreated {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        kind: MessageKind,
        preview: Option<String>,
    },
    /// The counterpart is typing. Carries no persisted state.
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// A message was read by its recipient.
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
    },
    /// The creator enabled a fan-initiated conversation.
    ConversationEnabled { conversation_id: ConversationId },
    /// A fulfillment window opened; the fan must join before it expires.
    WindowOpened {
        order_id: OrderId,
        conversation_id: ConversationId,
        expires_at: DateTime<Utc>,
    },
    /// A user went online or offline.
    PresenceChanged { user_id: UserId, online: bool },
}

/// A realtime event plus its emission timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The event itself, flattened into `type` + `payload`.
    #[serde(flatten)]
    pub event: RealtimeEvent,
}

impl EventEnvelope {
    /// Wrap an event with the current timestamp.
    #[must_use]
    pub fn now(event: RealtimeEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
