/// Data shared between the chat session, the store and the proxy endpoints.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Keep answers clear and concise.";
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
pub const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Locally generated identifier for a message that has not been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub String);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Persisted(Uuid),
    Temporary(TempId),
}

impl MessageId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, MessageId::Temporary(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Persisted(id) => write!(f, "{id}"),
            MessageId::Temporary(id) => write!(f, "{id}"),
        }
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        MessageId::Persisted(id)
    }
}

impl From<TempId> for MessageId {
    fn from(id: TempId) -> Self {
        MessageId::Temporary(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub model: String,
    pub provider: String,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a conversation; the store fills in the rest.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub user_id: Uuid,
    pub title: String,
    pub model: String,
    pub system_prompt: Option<String>,
}

/// Body of `POST /functions/v1/chat-stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamRequest {
    pub conversation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A message as sent to the chat-completion gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub role: Role,
    pub content: String,
}

/// Body forwarded to the chat-completion gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub model: String,
    pub messages: Vec<GatewayMessage>,
    pub stream: bool,
}

impl GatewayRequest {
    /// A streaming request with the system prompt ahead of the conversation history.
    pub fn streaming(model: String, system_prompt: &str, history: &[ChatMessage]) -> Self {
        let messages = std::iter::once(GatewayMessage {
            role: Role::System,
            content: system_prompt.to_string(),
        })
        .chain(history.iter().map(|message| GatewayMessage {
            role: message.role,
            content: message.content.clone(),
        }))
        .collect();

        Self {
            model,
            messages,
            stream: true,
        }
    }
}

/// Body of `POST /functions/v1/text-to-speech`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Body forwarded to the speech upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UpstreamSpeechRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) input: &'a str,
    pub(crate) voice: &'a str,
    pub(crate) response_format: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechResponse {
    #[serde(rename = "audioContent")]
    pub audio_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
