//! The chat session
//!
//! A [`ChatSession`] holds the signed-in user's conversations and the visible
//! message set of the current one. [`ChatSession::send_message`] persists the
//! user's message, opens a chat stream against the proxy and drives the
//! decoder and the [`MessageReconciler`] until the reply is persisted.

use axum::body::{Body, HttpBody};
use bon::Builder;
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::Credentials;
use crate::client::HttpClient;
use crate::errors::{SendError, TransportError};
use crate::handlers::CHAT_STREAM_PATH;
use crate::models::{
    ChatMessage, ChatStreamRequest, Conversation, DEFAULT_CONVERSATION_TITLE, DEFAULT_MODEL,
    NewConversation, Role,
};
use crate::reconciler::{CounterIdSource, IdSource, MessageReconciler, Transcript};
use crate::sse::{DecoderLimits, DeltaEvent, DeltaStream};
use crate::store::{ChatStore, StoreError};

#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Base URL of the proxy; the chat-stream path is appended to it.
    pub endpoint: Url,
    /// The signed-in user. Sending and loading require one.
    pub credentials: Option<Credentials>,
    /// Overall deadline for reading one reply. Unbounded when unset.
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub limits: DecoderLimits,
    /// Model given to newly created conversations.
    #[builder(default = DEFAULT_MODEL.to_string())]
    pub default_model: String,
}

#[derive(Debug)]
pub struct ChatSession<T: HttpClient, I: IdSource = CounterIdSource> {
    client: T,
    store: Arc<dyn ChatStore>,
    config: SessionConfig,
    ids: I,
    transcript: Transcript,
    conversations: Vec<Conversation>,
    current: Option<Uuid>,
    /// Forwards the current conversation's message feed into the transcript.
    feed: Option<JoinHandle<()>>,
}

impl<T: HttpClient> ChatSession<T> {
    pub fn new(client: T, store: Arc<dyn ChatStore>, config: SessionConfig) -> Self {
        Self::with_ids(client, store, config, CounterIdSource::new())
    }
}

impl<T: HttpClient, I: IdSource> ChatSession<T, I> {
    /// Create a session with a custom temporary-id source (useful for testing)
    pub fn with_ids(client: T, store: Arc<dyn ChatStore>, config: SessionConfig, ids: I) -> Self {
        Self {
            client,
            store,
            config,
            ids,
            transcript: Transcript::new(),
            conversations: Vec::new(),
            current: None,
            feed: None,
        }
    }

    /// The visible message set.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn current_conversation(&self) -> Option<&Conversation> {
        let id = self.current?;
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.config.credentials = credentials;
    }

    fn user_id(&self) -> Result<Uuid, SendError> {
        self.config
            .credentials
            .as_ref()
            .map(|c| c.user_id)
            .ok_or(SendError::Unauthenticated)
    }

    /// Fetch the user's conversations, newest first.
    ///
    /// Selects the first one when nothing is selected yet.
    #[instrument(skip(self))]
    pub async fn load_conversations(&mut self) -> Result<&[Conversation], SendError> {
        let user_id = self.user_id()?;
        self.conversations = self.store.list_conversations(user_id).await?;
        debug!("Loaded {} conversations", self.conversations.len());

        if self.current.is_none() {
            if let Some(first) = self.conversations.first().map(|c| c.id) {
                self.select_conversation(first).await?;
            }
        }
        Ok(&self.conversations)
    }

    /// Make `id` current and load its messages into the visible set.
    #[instrument(skip(self))]
    pub async fn select_conversation(&mut self, id: Uuid) -> Result<(), SendError> {
        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or(StoreError::ConversationNotFound(id))?;
        // Subscribe first so nothing inserted during the load is missed.
        let feed = self.store.subscribe_messages(id);
        let messages = self.store.list_messages(id).await?;

        if !self.conversations.iter().any(|c| c.id == id) {
            self.conversations.insert(0, conversation);
        }
        self.current = Some(id);
        self.transcript.replace_all(messages);
        self.follow(id, feed);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_conversation(&mut self) -> Result<Conversation, SendError> {
        let user_id = self.user_id()?;
        let conversation = self
            .store
            .create_conversation(NewConversation {
                user_id,
                title: DEFAULT_CONVERSATION_TITLE.to_string(),
                model: self.config.default_model.clone(),
                system_prompt: None,
            })
            .await?;
        info!(conversation_id = %conversation.id, "Created conversation");

        self.conversations.insert(0, conversation.clone());
        self.current = Some(conversation.id);
        self.transcript.clear();
        let feed = self.store.subscribe_messages(conversation.id);
        self.follow(conversation.id, feed);
        Ok(conversation)
    }

    /// Delete a conversation and its messages.
    ///
    /// If it was current, the first remaining conversation becomes current.
    #[instrument(skip(self))]
    pub async fn delete_conversation(&mut self, id: Uuid) -> Result<(), SendError> {
        self.store.delete_conversation(id).await?;
        self.conversations.retain(|c| c.id != id);

        if self.current == Some(id) {
            self.current = None;
            self.unfollow();
            self.transcript.clear();
            if let Some(next) = self.conversations.first().map(|c| c.id) {
                self.select_conversation(next).await?;
            }
        }
        Ok(())
    }

    /// Delete every message of the current conversation.
    #[instrument(skip(self))]
    pub async fn clear_conversation(&mut self) -> Result<(), SendError> {
        let Some(id) = self.current else {
            return Ok(());
        };
        self.store.clear_messages(id).await?;
        self.transcript.clear();
        Ok(())
    }

    /// Push messages inserted into `id` by anyone (another device, the proxy)
    /// into the transcript. Replaces any previous feed.
    fn follow(&mut self, id: Uuid, mut feed: broadcast::Receiver<ChatMessage>) {
        self.unfollow();
        let transcript = self.transcript.clone();
        self.feed = Some(tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(message) => transcript.push(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conversation_id = %id, "Message feed skipped {} messages", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!(conversation_id = %id, "Message feed closed");
                        break;
                    }
                }
            }
        }));
    }

    fn unfollow(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }

    /// Send `content` as the user and stream the assistant's reply.
    ///
    /// The reply is visible in the transcript while it streams. On success the
    /// persisted reply is returned and has replaced the in-flight message. On
    /// any failure the in-flight message is removed. Cancelling `cancel` ends
    /// the read loop and releases the response stream.
    #[instrument(skip(self, content, cancel), fields(len = content.len()))]
    pub async fn send_message(
        &mut self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage, SendError> {
        let credentials = self
            .config
            .credentials
            .clone()
            .ok_or(SendError::Unauthenticated)?;

        let conversation = match self.current_conversation() {
            Some(conversation) => conversation.clone(),
            None => self.create_conversation().await?,
        };

        let user_message = self
            .store
            .insert_message(conversation.id, Role::User, content)
            .await?;
        self.transcript.push(user_message);

        let mut reconciler = MessageReconciler::new(self.transcript.clone());
        if let Err(e) = self
            .stream_reply(&conversation, &credentials, &mut reconciler, cancel)
            .await
        {
            warn!(conversation_id = %conversation.id, "Reply failed: {}", e);
            reconciler.abort(&e.to_string())?;
            return Err(e);
        }

        let persisted = match self
            .store
            .insert_message(conversation.id, Role::Assistant, reconciler.text())
            .await
        {
            Ok(message) => message,
            Err(source) => {
                error!(conversation_id = %conversation.id, "Failed to save reply: {}", source);
                let text = reconciler.abort("reply could not be saved")?;
                return Err(SendError::ReplyNotSaved { text, source });
            }
        };
        reconciler.finish(persisted.clone())?;

        self.touch(conversation.id).await;
        Ok(persisted)
    }

    /// Open the chat stream and feed it through the reconciler up to the sentinel.
    async fn stream_reply(
        &self,
        conversation: &Conversation,
        credentials: &Credentials,
        reconciler: &mut MessageReconciler,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let request = self.chat_stream_request(conversation, credentials)?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status).into());
        }
        if response.body().is_end_stream() {
            return Err(TransportError::EmptyBody.into());
        }

        let mut deltas = DeltaStream::with_limits(
            Box::pin(response.into_body().into_data_stream()),
            self.config.limits,
        );
        reconciler.begin(&self.ids)?;

        let expiry = expire(self.config.timeout);
        tokio::pin!(expiry);

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(SendError::Cancelled),
                elapsed = &mut expiry => break Err(SendError::TimedOut(elapsed)),
                next = deltas.next() => next,
            };

            match next {
                Some(Ok(DeltaEvent::Content(delta))) => {
                    if let Err(e) = reconciler.append(&delta) {
                        break Err(e.into());
                    }
                }
                Some(Ok(DeltaEvent::Done)) => break Ok(()),
                Some(Err(e)) => break Err(TransportError::Read(e.to_string()).into()),
                None => break Err(TransportError::Incomplete.into()),
            }
        };

        drop(deltas);
        outcome
    }

    fn chat_stream_request(
        &self,
        conversation: &Conversation,
        credentials: &Credentials,
    ) -> Result<axum::extract::Request, TransportError> {
        let url = self
            .config
            .endpoint
            .join(CHAT_STREAM_PATH)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let body = serde_json::to_vec(&ChatStreamRequest {
            conversation_id: conversation.id,
            model: Some(conversation.model.clone()),
        })
        .map_err(|e| TransportError::Request(e.to_string()))?;

        axum::http::Request::builder()
            .method("POST")
            .uri(url.as_str())
            .header("content-type", "application/json")
            .header("authorization", credentials.authorization_header())
            .body(Body::from(body))
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    /// Record the reply time on the conversation. Failures are only logged.
    async fn touch(&mut self, id: Uuid) {
        let now = Utc::now();
        if let Err(e) = self.store.touch_conversation(id, now).await {
            warn!(conversation_id = %id, "Failed to update conversation timestamp: {}", e);
            return;
        }
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            conversation.last_message_at = Some(now);
            conversation.updated_at = now;
        }
    }
}

impl<T: HttpClient, I: IdSource> Drop for ChatSession<T, I> {
    fn drop(&mut self) {
        self.unfollow();
    }
}

/// Resolves with the timeout once it has elapsed, never when there is none.
async fn expire(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep_until(Instant::now() + timeout).await;
            timeout
        }
        None => std::future::pending().await,
    }
}
