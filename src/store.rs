//! Persistence for conversations and messages
//!
//! The chat session and the proxy never talk to a database directly; they go
//! through [`ChatStore`]. [`InMemoryStore`] backs the bundled server and the
//! tests. A hosted backend only has to implement the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ChatMessage, Conversation, MessageId, NewConversation, Role};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Storage for conversations and their messages.
///
/// Messages are returned oldest first, conversations most recently updated
/// first.
#[async_trait]
pub trait ChatStore: Send + Sync + std::fmt::Debug {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError>;

    /// Delete a conversation together with its messages.
    async fn delete_conversation(&self, id: Uuid) -> Result<(), StoreError>;

    /// Persist a message and return it with its durable identifier.
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ChatMessage, StoreError>;

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>, StoreError>;

    async fn clear_messages(&self, conversation_id: Uuid) -> Result<(), StoreError>;

    /// Record activity on a conversation.
    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Live feed of messages inserted into a conversation from now on, by
    /// anyone. The feed closes when the conversation is deleted.
    fn subscribe_messages(&self, conversation_id: Uuid) -> broadcast::Receiver<ChatMessage>;
}

/// Messages a slow feed subscriber may fall behind by before it lags.
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    conversations: Arc<DashMap<Uuid, Conversation>>,
    messages: Arc<DashMap<Uuid, Vec<ChatMessage>>>,
    feeds: Arc<DashMap<Uuid, broadcast::Sender<ChatMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            title: new.title,
            provider: provider_of(&new.model).to_string(),
            model: new.model,
            system_prompt: new.system_prompt,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };
        self.conversations
            .insert(conversation.id, conversation.clone());
        debug!(conversation_id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(&id).map(|entry| entry.clone()))
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<_> = self
            .conversations
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<(), StoreError> {
        self.conversations
            .remove(&id)
            .ok_or(StoreError::ConversationNotFound(id))?;
        self.messages.remove(&id);
        self.feeds.remove(&id);
        Ok(())
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }
        let message = ChatMessage {
            id: MessageId::Persisted(Uuid::new_v4()),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.messages
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        if let Some(feed) = self.feeds.get(&conversation_id) {
            // Nobody listening is fine.
            let _ = feed.send(message.clone());
        }
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages = self
            .messages
            .get(&conversation_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        // Stable, so messages created in the same instant keep insertion order.
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    async fn clear_messages(&self, conversation_id: Uuid) -> Result<(), StoreError> {
        self.messages.remove(&conversation_id);
        Ok(())
    }

    async fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::ConversationNotFound(id))?;
        conversation.last_message_at = Some(at);
        conversation.updated_at = at;
        Ok(())
    }

    fn subscribe_messages(&self, conversation_id: Uuid) -> broadcast::Receiver<ChatMessage> {
        self.feeds
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }
}

/// The gateway model names are `provider/model`.
fn provider_of(model: &str) -> &str {
    model.split_once('/').map_or("unknown", |(provider, _)| provider)
}
