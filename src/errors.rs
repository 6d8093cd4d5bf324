use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use crate::handlers::cors_headers;
use crate::models::ErrorBody;
use crate::reconciler::ReconcileError;
use crate::store::StoreError;

/// Failures of the HTTP exchange that carries a chat stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to start stream: upstream returned {0}")]
    Status(StatusCode),
    #[error("Failed to start stream: response has no body")]
    EmptyBody,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Stream read failed: {0}")]
    Read(String),
    #[error("Stream ended before the completion sentinel")]
    Incomplete,
}

/// Everything that can end a send operation early.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("No authenticated user")]
    Unauthenticated,
    #[error("Storage operation failed: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Assistant reply could not be saved: {source}")]
    ReplyNotSaved {
        /// The full generated text, so the caller can still show it.
        text: String,
        #[source]
        source: StoreError,
    },
    #[error("Stream cancelled")]
    Cancelled,
    #[error("Stream timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Errors returned by the proxy endpoints, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid input parameters")]
    InvalidInput,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Conversation not found or access denied")]
    ConversationNotFound,
    #[error("Failed to fetch messages")]
    MessagesUnavailable,
    #[error("Rate limits exceeded, please try again later.")]
    RateLimited,
    #[error("Payment required, please add funds to your AI gateway workspace.")]
    PaymentRequired,
    #[error("AI gateway error")]
    Gateway,
    #[error("Failed to process chat request")]
    ChatFailed,
    #[error("Failed to generate speech")]
    SpeechUpstream,
    #[error("Failed to process text-to-speech request")]
    SpeechFailed,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidInput => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::ConversationNotFound => StatusCode::NOT_FOUND,
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            ProxyError::MessagesUnavailable
            | ProxyError::Gateway
            | ProxyError::ChatFailed
            | ProxyError::SpeechUpstream
            | ProxyError::SpeechFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), cors_headers(), Json(body)).into_response()
    }
}
