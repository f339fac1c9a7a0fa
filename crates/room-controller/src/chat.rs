//! Chat persistence for rooms.

use crate::errors::RcError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomKey};
use serde::Serialize;
use sqlx::PgPool;
use tracing::instrument;

/// Maximum accepted chat text length, in characters, after trimming.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 2000;

/// A message about to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub room_key: RoomKey,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub message: String,
    pub recipient_id: Option<ParticipantId>,
}

impl NewChatMessage {
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.recipient_id.is_some()
    }
}

/// A stored message, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_key: RoomKey,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub message: String,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Public messages are visible to everyone; private ones only to the
    /// sender and the recipient.
    #[must_use]
    pub fn visible_to(&self, participant: &ParticipantId) -> bool {
        !self.is_private
            || &self.user_id == participant
            || self.recipient_id.as_ref() == Some(participant)
    }
}

/// Trim and bound chat text. Returns `None` when nothing valid remains.
#[must_use]
pub fn normalize_text(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() || text.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return None;
    }
    Some(text.to_string())
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, RcError>;

    /// The latest `limit` messages of a room, oldest first.
    async fn recent(&self, room_key: &RoomKey, limit: usize) -> Result<Vec<ChatMessage>, RcError>;
}

/// Postgres chat store over `chat_messages`.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    room_id: String,
    user_id: String,
    user_name: String,
    message: String,
    is_private: bool,
    recipient_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl ChatRow {
    fn into_message(self) -> Result<ChatMessage, RcError> {
        let room_key = RoomKey::parse(&self.room_id)
            .ok_or_else(|| RcError::ChatStore("stored message has an invalid room id".to_string()))?;
        Ok(ChatMessage {
            id: self.id,
            room_key,
            user_id: ParticipantId(self.user_id),
            user_name: self.user_name,
            message: self.message,
            is_private: self.is_private,
            recipient_id: self.recipient_id.map(ParticipantId),
            created_at: self.created_at,
        })
    }
}

fn store_error(operation: &'static str, e: &sqlx::Error) -> RcError {
    tracing::error!(target: "rc.chat", operation, error = %e, "Chat store query failed");
    RcError::ChatStore(e.to_string())
}

#[async_trait]
impl ChatStore for PgChatStore {
    #[instrument(skip_all, fields(room_key = %message.room_key))]
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, RcError> {
        let is_private = message.is_private();
        let row: ChatRow = sqlx::query_as(
            r#"
            INSERT INTO chat_messages (room_id, user_id, user_name, message, is_private, recipient_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id::TEXT AS id, room_id, user_id::TEXT AS user_id, user_name, message,
                      is_private, recipient_id::TEXT AS recipient_id, created_at
            "#,
        )
        .bind(message.room_key.as_str())
        .bind(message.user_id.as_str())
        .bind(&message.user_name)
        .bind(&message.message)
        .bind(is_private)
        .bind(message.recipient_id.as_ref().map(ParticipantId::as_str))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("append", &e))?;

        row.into_message()
    }

    #[instrument(skip_all, fields(room_key = %room_key, limit))]
    async fn recent(&self, room_key: &RoomKey, limit: usize) -> Result<Vec<ChatMessage>, RcError> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            r#"
            SELECT id::TEXT AS id, room_id, user_id::TEXT AS user_id, user_name, message,
                   is_private, recipient_id::TEXT AS recipient_id, created_at
            FROM chat_messages
            WHERE room_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(room_key.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("recent", &e))?;

        let mut messages = rows
            .into_iter()
            .map(ChatRow::into_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn message(from: &str, to: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: "1".to_string(),
            room_key: RoomKey::parse("R1").unwrap(),
            user_id: ParticipantId::from(from),
            user_name: from.to_string(),
            message: "hello".to_string(),
            is_private: to.is_some(),
            recipient_id: to.map(ParticipantId::from),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_public_message_visible_to_all() {
        let msg = message("alice", None);
        assert!(msg.visible_to(&ParticipantId::from("carol")));
    }

    #[test]
    fn test_private_message_visibility() {
        let msg = message("alice", Some("bob"));
        assert!(msg.visible_to(&ParticipantId::from("alice")));
        assert!(msg.visible_to(&ParticipantId::from("bob")));
        assert!(!msg.visible_to(&ParticipantId::from("carol")));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  hi  ").as_deref(), Some("hi"));
        assert_eq!(normalize_text("   "), None);
        assert!(normalize_text(&"x".repeat(MAX_CHAT_MESSAGE_CHARS)).is_some());
        assert!(normalize_text(&"x".repeat(MAX_CHAT_MESSAGE_CHARS + 1)).is_none());
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(message("alice", None)).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["isPrivate"], false);
        assert!(json.get("recipientId").is_none());
    }
}
