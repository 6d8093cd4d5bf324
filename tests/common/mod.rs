//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use flashchat::ProxySettings;
use flashchat::client::{ClientError, HttpClient};
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;
use url::Url;

/// Stands in for the chat-completion gateway: records request bodies and
/// answers every request with the same chunked body.
#[derive(Debug, Clone)]
pub struct MockGateway {
    status: StatusCode,
    chunks: Vec<String>,
    pub bodies: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockGateway {
    pub fn new(status: StatusCode, chunks: Vec<String>) -> Self {
        Self {
            status,
            chunks,
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockGateway {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, ClientError> {
        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await?;
        self.bodies
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&bytes)?);

        let chunks = self.chunks.clone();
        let stream = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
        );
        Ok(axum::response::Response::builder()
            .status(self.status)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(stream))?)
    }
}

/// Sends requests straight into a router, so a session can talk to the proxy
/// without a socket.
#[derive(Debug, Clone)]
pub struct RouterClient {
    router: Router,
}

impl RouterClient {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl HttpClient for RouterClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, ClientError> {
        Ok(self.router.clone().oneshot(req).await?)
    }
}

pub fn settings() -> ProxySettings {
    ProxySettings::builder()
        .gateway_url(Url::parse("https://gateway.test/v1/chat/completions").unwrap())
        .gateway_key("gateway-key".to_string())
        .speech_url(Url::parse("https://speech.test/v1/audio/speech").unwrap())
        .speech_key("speech-key".to_string())
        .build()
}

/// Frame each delta as an SSE data event and end with the sentinel.
pub fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let event = serde_json::json!({"choices": [{"delta": {"content": delta}}]});
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str(": keep-alive\n\ndata: [DONE]\n\n");
    body
}
