//! Repository ports for persisted entities.
//!
//! Persisted status is the only shared mutable resource in the system, and
//! every mutation here is a conditional single-row update guarded by the
//! previously-read value. A guard miss returns `None` rather than erroring:
//! losing a race is an expected outcome the service layer translates into
//! `InvalidState` or idempotent success.

use crate::errors::CoreError;
use crate::models::{CallSession, CallStatus, Conversation, FulfillmentWindow, Message, ServiceOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, ConversationId, MessageId, OrderId, UserId};

pub mod memory;
pub mod postgres;

/// Fields a call transition may set, applied only when the status guard
/// holds. `None` fields keep their stored value.
#[derive(Debug, Clone, Copy)]
pub struct CallPatch {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

/// Which side of a fulfillment window is joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSide {
    Creator,
    Fan,
}

/// Call session persistence.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Persist a new call session.
    async fn create_call(&self, call: &CallSession) -> Result<(), CoreError>;

    /// Load a call session.
    async fn get_call(&self, id: CallId) -> Result<Option<CallSession>, CoreError>;

    /// Conditionally transition a call: the patch applies only if the
    /// current status is in `from`. Returns the updated session, or `None`
    /// when the guard fails (including a concurrent writer winning first).
    async fn transition_call(
        &self,
        id: CallId,
        from: &[CallStatus],
        patch: CallPatch,
    ) -> Result<Option<CallSession>, CoreError>;
}

/// Conversation persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a new conversation. The (creator, fan) pair is unique: when
    /// a racing create for the same pair landed first, the existing row is
    /// returned instead of the candidate.
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation, CoreError>;

    /// Load a conversation by id.
    async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError>;

    /// Load the conversation for a (creator, fan) pair, if any.
    async fn find_by_pair(
        &self,
        creator_id: UserId,
        fan_id: UserId,
    ) -> Result<Option<Conversation>, CoreError>;

    /// Enable the conversation (idempotent). Returns the updated row.
    async fn enable_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError>;

    /// Update the summary fields after a new message.
    async fn touch_summary(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
        preview: &str,
    ) -> Result<(), CoreError>;

    /// Link a service order to the conversation.
    async fn set_linked_order(
        &self,
        id: ConversationId,
        order_id: OrderId,
    ) -> Result<(), CoreError>;
}

/// Message persistence. Messages are append-only; only `read_at` mutates.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message.
    async fn insert_message(&self, message: &Message) -> Result<(), CoreError>;

    /// Load a message.
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, CoreError>;

    /// Messages strictly older than the cursor message (by creation time,
    /// id as tiebreak), newest first, at most `limit`.
    async fn page_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, CoreError>;

    /// Set `read_at` if and only if it is still null (first write wins).
    /// Returns the row after the operation, updated or not.
    async fn mark_read(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, CoreError>;
}

/// Service order reads plus fulfillment window persistence.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Load a service order. Orders are owned elsewhere; read-only here.
    async fn get_order(&self, id: OrderId) -> Result<Option<ServiceOrder>, CoreError>;

    /// Persist a new fulfillment window (one per order).
    async fn create_window(&self, window: &FulfillmentWindow) -> Result<(), CoreError>;

    /// Load the window for an order.
    async fn get_window(&self, order_id: OrderId) -> Result<Option<FulfillmentWindow>, CoreError>;

    /// Stamp one side's join timestamp if it is still null (first write
    /// wins; a second join keeps the original stamp). Returns the window
    /// after the operation.
    async fn stamp_join(
        &self,
        order_id: OrderId,
        side: WindowSide,
        at: DateTime<Utc>,
    ) -> Result<Option<FulfillmentWindow>, CoreError>;
}
