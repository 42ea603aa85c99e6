//! In-memory repository implementations.
//!
//! Used by unit tests and local development. Guard semantics are identical
//! to the Postgres backend: conditional writes check the current value
//! under one lock, so racing callers observe the same first-write-wins
//! behavior.

use crate::errors::CoreError;
use crate::models::{CallSession, CallStatus, Conversation, FulfillmentWindow, Message, ServiceOrder};
use crate::store::{CallPatch, CallStore, ConversationStore, MessageStore, WindowSide, WindowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, ConversationId, MessageId, OrderId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    calls: HashMap<CallId, CallSession>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<MessageId, Message>,
    orders: HashMap<OrderId, ServiceOrder>,
    windows: HashMap<OrderId, FulfillmentWindow>,
}

/// In-memory store implementing every repository port.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a service order (orders are owned by an out-of-scope system;
    /// tests plant them directly).
    pub async fn insert_order(&self, order: ServiceOrder) {
        self.inner.lock().await.orders.insert(order.id, order);
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create_call(&self, call: &CallSession) -> Result<(), CoreError> {
        self.inner.lock().await.calls.insert(call.id, call.clone());
        Ok(())
    }

    async fn get_call(&self, id: CallId) -> Result<Option<CallSession>, CoreError> {
        Ok(self.inner.lock().await.calls.get(&id).cloned())
    }

    async fn transition_call(
        &self,
        id: CallId,
        from: &[CallStatus],
        patch: CallPatch,
    ) -> Result<Option<CallSession>, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(call) = inner.calls.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&call.status) {
            return Ok(None);
        }

        call.status = patch.status;
        if patch.started_at.is_some() {
            call.started_at = patch.started_at;
        }
        if patch.ended_at.is_some() {
            call.ended_at = patch.ended_at;
        }
        if patch.duration_seconds.is_some() {
            call.duration_seconds = patch.duration_seconds;
        }

        Ok(Some(call.clone()))
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation, CoreError> {
        let mut inner = self.inner.lock().await;
        // Pair uniqueness: a racing create resolves to whichever row landed
        // first, matching the Postgres conflict handling.
        if let Some(existing) = inner
            .conversations
            .values()
            .find(|c| c.creator_id == conversation.creator_id && c.fan_id == conversation.fan_id)
        {
            return Ok(existing.clone());
        }
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation.clone())
    }

    async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError> {
        Ok(self.inner.lock().await.conversations.get(&id).cloned())
    }

    async fn find_by_pair(
        &self,
        creator_id: UserId,
        fan_id: UserId,
    ) -> Result<Option<Conversation>, CoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .conversations
            .values()
            .find(|c| c.creator_id == creator_id && c.fan_id == fan_id)
            .cloned())
    }

    async fn enable_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner.conversations.get_mut(&id) else {
            return Ok(None);
        };
        conversation.enabled = true;
        Ok(Some(conversation.clone()))
    }

    async fn touch_summary(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
        preview: &str,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.conversations.get_mut(&id) {
            conversation.last_message_at = Some(at);
            conversation.last_message_preview = Some(preview.to_string());
        }
        Ok(())
    }

    async fn set_linked_order(
        &self,
        id: ConversationId,
        order_id: OrderId,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.conversations.get_mut(&id) {
            conversation.linked_order_id = Some(order_id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), CoreError> {
        self.inner
            .lock()
            .await
            .messages
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, CoreError> {
        Ok(self.inner.lock().await.messages.get(&id).cloned())
    }

    async fn page_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, CoreError> {
        let inner = self.inner.lock().await;

        let cursor = match before {
            Some(id) => match inner.messages.get(&id) {
                Some(message) => Some((message.created_at, message.id)),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut page: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| match cursor {
                Some(cursor) => (m.created_at, m.id) < cursor,
                None => true,
            })
            .cloned()
            .collect();

        page.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn mark_read(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.read_at.is_none() {
            message.read_at = Some(at);
        }
        Ok(Some(message.clone()))
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn get_order(&self, id: OrderId) -> Result<Option<ServiceOrder>, CoreError> {
        Ok(self.inner.lock().await.orders.get(&id).cloned())
    }

    async fn create_window(&self, window: &FulfillmentWindow) -> Result<(), CoreError> {
        self.inner
            .lock()
            .await
            .windows
            .insert(window.order_id, window.clone());
        Ok(())
    }

    async fn get_window(&self, order_id: OrderId) -> Result<Option<FulfillmentWindow>, CoreError> {
        Ok(self.inner.lock().await.windows.get(&order_id).cloned())
    }

    async fn stamp_join(
        &self,
        order_id: OrderId,
        side: WindowSide,
        at: DateTime<Utc>,
    ) -> Result<Option<FulfillmentWindow>, CoreError> {
        let mut inner = self.inner.lock().await;
        let Some(window) = inner.windows.get_mut(&order_id) else {
            return Ok(None);
        };
        match side {
            WindowSide::Creator => {
                if window.creator_joined_at.is_none() {
                    window.creator_joined_at = Some(at);
                }
            }
            WindowSide::Fan => {
                if window.fan_joined_at.is_none() {
                    window.fan_joined_at = Some(at);
                }
            }
        }
        Ok(Some(window.clone()))
    }
}
