//! Conversation and message delivery.
//!
//! Messages are persisted before any fan-out: the database row is the
//! source of truth and realtime delivery is a best-effort hint on top.
//! A fan-initiated conversation starts disabled and the fan cannot send
//! until the creator enables it; the creator can always send.

use crate::errors::CoreError;
use crate::models::{Conversation, Message};
use crate::notify::NotificationDispatch;
use crate::presence::PresenceTracker;
use crate::router::EventSink;
use crate::store::{ConversationStore, MessageStore};
use chrono::Utc;
use common::capabilities::{Capability, CapabilitySet};
use common::events::{EventEnvelope, MessageKind, RealtimeEvent};
use common::types::{ConversationId, MessageId, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Hard cap on a page of message history.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Outbound content of a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
}

/// One page of message history, oldest first, with a cursor for the next
/// (older) page when more history exists.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<MessageId>,
}

/// The messaging service.
pub struct Messaging {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    sink: Arc<dyn EventSink>,
    presence: Arc<PresenceTracker>,
    notify: Arc<dyn NotificationDispatch>,
}

impl Messaging {
    /// Wire up the service.
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        sink: Arc<dyn EventSink>,
        presence: Arc<PresenceTracker>,
        notify: Arc<dyn NotificationDispatch>,
    ) -> Self {
        Self {
            conversations,
            messages,
            sink,
            presence,
            notify,
        }
    }

    /// Find or lazily create the conversation for a (creator, fan) pair.
    ///
    /// The actor must be one of the two parties. A conversation opened by
    /// the creator is enabled immediately; one opened by the fan waits for
    /// the creator to enable it.
    #[instrument(skip_all, fields(creator_id = %creator_id, fan_id = %fan_id, actor = %caps.actor()))]
    pub async fn open_conversation(
        &self,
        caps: &CapabilitySet,
        creator_id: UserId,
        fan_id: UserId,
    ) -> Result<Conversation, CoreError> {
        let actor = caps.actor();
        if actor != creator_id && actor != fan_id {
            return Err(CoreError::Forbidden(
                "not a party of this conversation".to_string(),
            ));
        }

        if let Some(existing) = self.conversations.find_by_pair(creator_id, fan_id).await? {
            return Ok(existing);
        }

        let candidate = Conversation {
            id: ConversationId::new(),
            creator_id,
            fan_id,
            enabled: actor == creator_id,
            last_message_at: None,
            last_message_preview: None,
            linked_order_id: None,
            created_at: Utc::now(),
        };
        // A concurrent open for the same pair may land between the lookup
        // above and this insert; the store resolves the race to the row
        // that won, so both callers get the same conversation.
        let conversation = self.conversations.create_conversation(&candidate).await?;

        if conversation.id == candidate.id {
            info!(
                target: "rt.messaging",
                conversation_id = %conversation.id,
                enabled = conversation.enabled,
                "Conversation created"
            );
        }

        Ok(conversation)
    }

    /// Persist a message and fan it out to the counterpart.
    ///
    /// A fan sending into a disabled conversation is refused; the creator
    /// is never gated. An offline counterpart gets a push notification.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, sender_id = %caps.actor()))]
    pub async fn send_message(
        &self,
        caps: &CapabilitySet,
        conversation_id: ConversationId,
        new_message: NewMessage,
    ) -> Result<Message, CoreError> {
        let sender_id = caps.actor();
        let conversation = self.load(conversation_id).await?;
        let counterpart = conversation
            .counterpart(sender_id)
            .ok_or_else(|| CoreError::Forbidden("not a party of this conversation".to_string()))?;

        if sender_id == conversation.fan_id && !conversation.enabled {
            return Err(CoreError::Forbidden(
                "conversation is not enabled".to_string(),
            ));
        }

        if new_message.kind == MessageKind::Text
            && new_message.content.as_deref().unwrap_or("").is_empty()
        {
            return Err(CoreError::InvalidState(
                "text message has no content".to_string(),
            ));
        }

        let message = Message {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            kind: new_message.kind,
            content: new_message.content,
            media_url: new_message.media_url,
            created_at: Utc::now(),
            read_at: None,
        };
        self.messages.insert_message(&message).await?;

        let preview = message.preview();
        self.conversations
            .touch_summary(conversation_id, message.created_at, &preview)
            .await?;

        debug!(
            target: "rt.messaging",
            message_id = %message.id,
            kind = message.kind.as_str(),
            "Message persisted"
        );

        let envelope = EventEnvelope::now(RealtimeEvent::MessageCreated {
            conversation_id,
            message_id: message.id,
            sender_id,
            kind: message.kind,
            preview: Some(preview),
        });
        self.sink.send_to_user(counterpart, envelope.clone()).await;

        if !self.presence.is_online(counterpart).await {
            if let Err(e) = self.notify.deliver(counterpart, &envelope).await {
                warn!(
                    target: "rt.messaging",
                    message_id = %message.id,
                    error = %e,
                    "Message push failed"
                );
            }
        }

        Ok(message)
    }

    /// One page of history, newest-first internally, returned oldest first.
    ///
    /// The cursor is the id of the oldest message of the previous page;
    /// paging with it never skips or repeats a message even while new
    /// messages arrive, because the cursor anchors on (created_at, id)
    /// rather than an offset.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, actor = %caps.actor()))]
    pub async fn list_messages(
        &self,
        caps: &CapabilitySet,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<MessagePage, CoreError> {
        let conversation = self.load(conversation_id).await?;
        if !conversation.is_participant(caps.actor()) {
            return Err(CoreError::Forbidden(
                "not a party of this conversation".to_string(),
            ));
        }

        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let mut messages = self
            .messages
            .page_messages(conversation_id, before, limit)
            .await?;

        // A full page may have older history behind it; a short page is
        // definitively the end.
        let next_cursor = if messages.len() == limit as usize {
            messages.last().map(|m| m.id)
        } else {
            None
        };

        messages.reverse();
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Mark a message read. Idempotent: the first read stamps the
    /// timestamp, later reads return the message unchanged.
    #[instrument(skip_all, fields(message_id = %message_id, reader_id = %caps.actor()))]
    pub async fn mark_read(
        &self,
        caps: &CapabilitySet,
        message_id: MessageId,
    ) -> Result<Message, CoreError> {
        let reader_id = caps.actor();
        let message = self
            .messages
            .get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("message".to_string()))?;
        let conversation = self.load(message.conversation_id).await?;
        if !conversation.is_participant(reader_id) {
            return Err(CoreError::Forbidden(
                "not a party of this conversation".to_string(),
            ));
        }
        if message.sender_id == reader_id {
            return Err(CoreError::Forbidden(
                "cannot mark own message read".to_string(),
            ));
        }

        let already_read = message.read_at.is_some();
        let updated = self
            .messages
            .mark_read(message_id, Utc::now())
            .await?
            .ok_or_else(|| CoreError::NotFound("message".to_string()))?;

        if !already_read {
            self.sink
                .send_to_user(
                    message.sender_id,
                    EventEnvelope::now(RealtimeEvent::MessageRead {
                        conversation_id: message.conversation_id,
                        message_id,
                        reader_id,
                    }),
                )
                .await;
        }

        Ok(updated)
    }

    /// Relay a typing indicator to the counterpart. Nothing is persisted
    /// and an offline counterpart simply misses it.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, user_id = %caps.actor()))]
    pub async fn typing(
        &self,
        caps: &CapabilitySet,
        conversation_id: ConversationId,
    ) -> Result<(), CoreError> {
        let user_id = caps.actor();
        let conversation = self.load(conversation_id).await?;
        let counterpart = conversation
            .counterpart(user_id)
            .ok_or_else(|| CoreError::Forbidden("not a party of this conversation".to_string()))?;

        self.sink
            .send_to_user(
                counterpart,
                EventEnvelope::now(RealtimeEvent::Typing {
                    conversation_id,
                    user_id,
                }),
            )
            .await;
        Ok(())
    }

    /// Enable a fan-initiated conversation. Creator only; idempotent.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, actor = %caps.actor()))]
    pub async fn enable_conversation(
        &self,
        caps: &CapabilitySet,
        conversation_id: ConversationId,
    ) -> Result<Conversation, CoreError> {
        let conversation = self.load(conversation_id).await?;
        if caps.actor() != conversation.creator_id || !caps.has(Capability::CreatorOf) {
            return Err(CoreError::Forbidden(
                "only the creator may enable".to_string(),
            ));
        }

        let was_enabled = conversation.enabled;
        let updated = self
            .conversations
            .enable_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("conversation".to_string()))?;

        if !was_enabled {
            info!(
                target: "rt.messaging",
                conversation_id = %conversation_id,
                "Conversation enabled"
            );
            self.sink
                .send_to_user(
                    updated.fan_id,
                    EventEnvelope::now(RealtimeEvent::ConversationEnabled { conversation_id }),
                )
                .await;
        }

        Ok(updated)
    }

    async fn load(&self, id: ConversationId) -> Result<Conversation, CoreError> {
        self.conversations
            .get_conversation(id)
            .await?
            .ok_or_else(|| CoreError::NotFound("conversation".to_string()))
    }
}
