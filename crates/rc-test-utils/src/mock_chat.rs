//! In-memory chat store.

use async_trait::async_trait;
use common::types::RoomKey;
use room_controller::chat::{ChatMessage, ChatStore, NewChatMessage};
use room_controller::errors::RcError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<ChatMessage>,
    fail_appends: bool,
    fail_reads: bool,
    read_delay: Option<Duration>,
}

/// Chat store that keeps messages in insertion order. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockChatStore {
    inner: Arc<Mutex<Inner>>,
}

impl MockChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_appends(&self, failing: bool) {
        self.inner.lock().unwrap().fail_appends = failing;
    }

    pub fn set_fail_reads(&self, failing: bool) {
        self.inner.lock().unwrap().fail_reads = failing;
    }

    /// Make `recent` sleep before answering.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().read_delay = delay;
    }

    /// Everything stored so far, private messages included.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().unwrap().messages.clone()
    }
}

#[async_trait]
impl ChatStore for MockChatStore {
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, RcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_appends {
            return Err(RcError::ChatStore("mock chat store unavailable".to_string()));
        }
        let stored = ChatMessage {
            id: (inner.messages.len() + 1).to_string(),
            is_private: message.is_private(),
            room_key: message.room_key,
            user_id: message.user_id,
            user_name: message.user_name,
            message: message.message,
            recipient_id: message.recipient_id,
            created_at: chrono::Utc::now(),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent(&self, room_key: &RoomKey, limit: usize) -> Result<Vec<ChatMessage>, RcError> {
        let delay = self.inner.lock().unwrap().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().unwrap();
        if inner.fail_reads {
            return Err(RcError::ChatStore("mock chat store unavailable".to_string()));
        }
        let matching: Vec<_> = inner
            .messages
            .iter()
            .filter(|m| &m.room_key == room_key)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }
}
