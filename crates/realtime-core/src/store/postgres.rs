//! Postgres repository implementations.
//!
//! All queries are parameterized. Conditional updates are single-row
//! `UPDATE ... WHERE <guard>` statements; the row count (or `RETURNING`
//! presence) tells the caller whether the guard held. No transactions are
//! needed because no operation spans more than one row.

use crate::errors::CoreError;
use crate::models::{
    CallSession, CallStatus, Conversation, FulfillmentWindow, Message, OrderStatus, ServiceOrder,
};
use crate::store::{CallPatch, CallStore, ConversationStore, MessageStore, WindowSide, WindowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::events::{CallKind, MessageKind};
use common::types::{CallId, ConversationId, MessageId, OrderId, UserId};
use sqlx::PgPool;
use tracing::{error, instrument};
use uuid::Uuid;

/// Postgres-backed store implementing every repository port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt_row(entity: &'static str, field: &'static str) -> CoreError {
    error!(target: "rt.store.postgres", entity, field, "Corrupt row value");
    CoreError::Internal
}

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct CallRow {
    id: Uuid,
    caller_id: Uuid,
    receiver_id: Uuid,
    kind: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    room: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CallRow> for CallSession {
    type Error = CoreError;

    fn try_from(row: CallRow) -> Result<Self, CoreError> {
        Ok(CallSession {
            id: CallId(row.id),
            caller_id: UserId(row.caller_id),
            receiver_id: UserId(row.receiver_id),
            kind: CallKind::parse(&row.kind).ok_or_else(|| corrupt_row("call", "kind"))?,
            status: CallStatus::parse(&row.status).ok_or_else(|| corrupt_row("call", "status"))?,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            room: row.room,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    creator_id: Uuid,
    fan_id: Uuid,
    enabled: bool,
    last_message_at: Option<DateTime<Utc>>,
    last_message_preview: Option<String>,
    linked_order_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: ConversationId(row.id),
            creator_id: UserId(row.creator_id),
            fan_id: UserId(row.fan_id),
            enabled: row.enabled,
            last_message_at: row.last_message_at,
            last_message_preview: row.last_message_preview,
            linked_order_id: row.linked_order_id.map(OrderId),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    kind: String,
    content: Option<String>,
    media_url: Option<String>,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> Result<Self, CoreError> {
        Ok(Message {
            id: MessageId(row.id),
            conversation_id: ConversationId(row.conversation_id),
            sender_id: UserId(row.sender_id),
            kind: MessageKind::parse(&row.kind).ok_or_else(|| corrupt_row("message", "kind"))?,
            content: row.content,
            media_url: row.media_url,
            created_at: row.created_at,
            read_at: row.read_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    creator_id: Uuid,
    fan_id: Uuid,
    status: String,
}

impl TryFrom<OrderRow> for ServiceOrder {
    type Error = CoreError;

    fn try_from(row: OrderRow) -> Result<Self, CoreError> {
        Ok(ServiceOrder {
            id: OrderId(row.id),
            creator_id: UserId(row.creator_id),
            fan_id: UserId(row.fan_id),
            status: OrderStatus::parse(&row.status)
                .ok_or_else(|| corrupt_row("service_order", "status"))?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WindowRow {
    order_id: Uuid,
    creator_id: Uuid,
    fan_id: Uuid,
    conversation_id: Uuid,
    expires_at: DateTime<Utc>,
    creator_joined_at: Option<DateTime<Utc>>,
    fan_joined_at: Option<DateTime<Utc>>,
}

impl From<WindowRow> for FulfillmentWindow {
    fn from(row: WindowRow) -> Self {
        FulfillmentWindow {
            order_id: OrderId(row.order_id),
            creator_id: UserId(row.creator_id),
            fan_id: UserId(row.fan_id),
            conversation_id: ConversationId(row.conversation_id),
            expires_at: row.expires_at,
            creator_joined_at: row.creator_joined_at,
            fan_joined_at: row.fan_joined_at,
        }
    }
}

// ============================================================================
// CallStore
// ============================================================================

#[async_trait]
impl CallStore for PgStore {
    #[instrument(skip_all, fields(call_id = %call.id))]
    async fn create_call(&self, call: &CallSession) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO calls
                (id, caller_id, receiver_id, kind, status,
                 started_at, ended_at, duration_seconds, room, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(call.id.0)
        .bind(call.caller_id.0)
        .bind(call.receiver_id.0)
        .bind(call.kind.as_str())
        .bind(call.status.as_str())
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration_seconds)
        .bind(&call.room)
        .bind(call.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(call_id = %id))]
    async fn get_call(&self, id: CallId) -> Result<Option<CallSession>, CoreError> {
        let row: Option<CallRow> = sqlx::query_as(
            r#"
            SELECT id, caller_id, receiver_id, kind, status,
                   started_at, ended_at, duration_seconds, room, created_at
            FROM calls
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallSession::try_from).transpose()
    }

    #[instrument(skip_all, fields(call_id = %id, to = patch.status.as_str()))]
    async fn transition_call(
        &self,
        id: CallId,
        from: &[CallStatus],
        patch: CallPatch,
    ) -> Result<Option<CallSession>, CoreError> {
        let allowed: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let row: Option<CallRow> = sqlx::query_as(
            r#"
            UPDATE calls
            SET status = $2,
                started_at = COALESCE($3, started_at),
                ended_at = COALESCE($4, ended_at),
                duration_seconds = COALESCE($5, duration_seconds)
            WHERE id = $1
              AND status = ANY($6)
            RETURNING id, caller_id, receiver_id, kind, status,
                      started_at, ended_at, duration_seconds, room, created_at
            "#,
        )
        .bind(id.0)
        .bind(patch.status.as_str())
        .bind(patch.started_at)
        .bind(patch.ended_at)
        .bind(patch.duration_seconds)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallSession::try_from).transpose()
    }
}

// ============================================================================
// ConversationStore
// ============================================================================

#[async_trait]
impl ConversationStore for PgStore {
    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Conversation, CoreError> {
        // Two opens can race between find_by_pair and this insert. The no-op
        // conflict update makes RETURNING yield the surviving row either way,
        // so the loser resolves to the existing conversation instead of a
        // unique-violation error.
        let row: ConversationRow = sqlx::query_as(
            r#"
            INSERT INTO conversations
                (id, creator_id, fan_id, enabled,
                 last_message_at, last_message_preview, linked_order_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (creator_id, fan_id)
                DO UPDATE SET creator_id = EXCLUDED.creator_id
            RETURNING id, creator_id, fan_id, enabled,
                      last_message_at, last_message_preview, linked_order_id, created_at
            "#,
        )
        .bind(conversation.id.0)
        .bind(conversation.creator_id.0)
        .bind(conversation.fan_id.0)
        .bind(conversation.enabled)
        .bind(conversation.last_message_at)
        .bind(&conversation.last_message_preview)
        .bind(conversation.linked_order_id.map(|o| o.0))
        .bind(conversation.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, creator_id, fan_id, enabled,
                   last_message_at, last_message_preview, linked_order_id, created_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    #[instrument(skip_all, fields(creator_id = %creator_id, fan_id = %fan_id))]
    async fn find_by_pair(
        &self,
        creator_id: UserId,
        fan_id: UserId,
    ) -> Result<Option<Conversation>, CoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, creator_id, fan_id, enabled,
                   last_message_at, last_message_preview, linked_order_id, created_at
            FROM conversations
            WHERE creator_id = $1 AND fan_id = $2
            "#,
        )
        .bind(creator_id.0)
        .bind(fan_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    async fn enable_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            UPDATE conversations
            SET enabled = TRUE
            WHERE id = $1
            RETURNING id, creator_id, fan_id, enabled,
                      last_message_at, last_message_preview, linked_order_id, created_at
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    async fn touch_summary(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
        preview: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = $2,
                last_message_preview = $3
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(at)
        .bind(preview)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(conversation_id = %id, order_id = %order_id))]
    async fn set_linked_order(
        &self,
        id: ConversationId,
        order_id: OrderId,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET linked_order_id = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(order_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// MessageStore
// ============================================================================

#[async_trait]
impl MessageStore for PgStore {
    #[instrument(skip_all, fields(message_id = %message.id))]
    async fn insert_message(&self, message: &Message) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, kind,
                 content, media_url, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id.0)
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(message.kind.as_str())
        .bind(&message.content)
        .bind(&message.media_url)
        .bind(message.created_at)
        .bind(message.read_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, CoreError> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, sender_id, kind,
                   content, media_url, created_at, read_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id, limit = limit))]
    async fn page_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, CoreError> {
        // The cursor is a message id; page strictly older than it, with the
        // id as tiebreak for identical timestamps.
        let rows: Vec<MessageRow> = match before {
            Some(cursor) => {
                sqlx::query_as(
                    r#"
                    SELECT m.id, m.conversation_id, m.sender_id, m.kind,
                           m.content, m.media_url, m.created_at, m.read_at
                    FROM messages m, messages c
                    WHERE c.id = $2
                      AND m.conversation_id = $1
                      AND (m.created_at, m.id) < (c.created_at, c.id)
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT $3
                    "#,
                )
                .bind(conversation_id.0)
                .bind(cursor.0)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, conversation_id, sender_id, kind,
                           content, media_url, created_at, read_at
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(conversation_id.0)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Message::try_from).collect()
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_read(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, CoreError> {
        // First write wins; a second mark_read leaves the original stamp.
        sqlx::query(
            r#"
            UPDATE messages
            SET read_at = $2
            WHERE id = $1
              AND read_at IS NULL
            "#,
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        self.get_message(id).await
    }
}

// ============================================================================
// WindowStore
// ============================================================================

#[async_trait]
impl WindowStore for PgStore {
    #[instrument(skip_all, fields(order_id = %id))]
    async fn get_order(&self, id: OrderId) -> Result<Option<ServiceOrder>, CoreError> {
        let row: Option<OrderRow> = sqlx::query_as(
            r#"
            SELECT id, creator_id, fan_id, status
            FROM service_orders
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceOrder::try_from).transpose()
    }

    #[instrument(skip_all, fields(order_id = %window.order_id))]
    async fn create_window(&self, window: &FulfillmentWindow) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO fulfillment_windows
                (order_id, creator_id, fan_id, conversation_id,
                 expires_at, creator_joined_at, fan_joined_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(window.order_id.0)
        .bind(window.creator_id.0)
        .bind(window.fan_id.0)
        .bind(window.conversation_id.0)
        .bind(window.expires_at)
        .bind(window.creator_joined_at)
        .bind(window.fan_joined_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(order_id = %order_id))]
    async fn get_window(&self, order_id: OrderId) -> Result<Option<FulfillmentWindow>, CoreError> {
        let row: Option<WindowRow> = sqlx::query_as(
            r#"
            SELECT order_id, creator_id, fan_id, conversation_id,
                   expires_at, creator_joined_at, fan_joined_at
            FROM fulfillment_windows
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FulfillmentWindow::from))
    }

    #[instrument(skip_all, fields(order_id = %order_id, side = ?side))]
    async fn stamp_join(
        &self,
        order_id: OrderId,
        side: WindowSide,
        at: DateTime<Utc>,
    ) -> Result<Option<FulfillmentWindow>, CoreError> {
        let query = match side {
            WindowSide::Creator => {
                r#"
                UPDATE fulfillment_windows
                SET creator_joined_at = $2
                WHERE order_id = $1
                  AND creator_joined_at IS NULL
                "#
            }
            WindowSide::Fan => {
                r#"
                UPDATE fulfillment_windows
                SET fan_joined_at = $2
                WHERE order_id = $1
                  AND fan_joined_at IS NULL
                "#
            }
        };

        sqlx::query(query)
            .bind(order_id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;

        self.get_window(order_id).await
    }
}
