/// Axum handlers for the proxy endpoints
///
/// `chat-stream` looks up a conversation, forwards it to the chat-completion
/// gateway as a streaming request and relays the SSE body back untouched.
/// `text-to-speech` forwards text to the speech upstream and returns the audio
/// as base64 JSON.
use crate::auth::is_authorized;
use crate::client::HttpClient;
use crate::errors::ProxyError;
use crate::models::{
    ChatStreamRequest, DEFAULT_VOICE, GatewayRequest, SpeechRequest, SpeechResponse,
    UpstreamSpeechRequest,
};
use crate::AppState;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tracing::{debug, error, info, instrument};
use url::Url;

pub const CHAT_STREAM_PATH: &str = "/functions/v1/chat-stream";
pub const SPEECH_PATH: &str = "/functions/v1/text-to-speech";

const SPEECH_MODEL: &str = "tts-1";
const SPEECH_FORMAT: &str = "mp3";

/// Upstream error bodies are only read for logging.
const ERROR_BODY_LIMIT: usize = 64 * 1024;
const AUDIO_BODY_LIMIT: usize = 32 * 1024 * 1024;

const ALLOWED_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

pub fn cors_headers() -> [(HeaderName, &'static str); 2] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS),
    ]
}

pub async fn chat_stream_preflight() -> impl IntoResponse {
    (StatusCode::OK, cors_headers())
}

pub async fn speech_preflight() -> impl IntoResponse {
    (StatusCode::OK, cors_headers(), "ok")
}

#[instrument(skip(state, headers, body))]
pub async fn chat_stream<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request: ChatStreamRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!("Rejecting chat-stream body: {}", e);
        ProxyError::InvalidInput
    })?;

    let Some(gateway_key) = state.settings.gateway_key.as_deref() else {
        error!("Chat gateway API key is not configured");
        return Err(ProxyError::ChatFailed);
    };

    if !is_authorized(state.settings.keys.as_ref(), &headers) {
        return Err(ProxyError::Unauthorized);
    }

    let conversation_id = request.conversation_id;
    let conversation = match state.store.get_conversation(conversation_id).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return Err(ProxyError::ConversationNotFound),
        Err(e) => {
            error!("Error fetching conversation {}: {}", conversation_id, e);
            return Err(ProxyError::ConversationNotFound);
        }
    };

    let history = state
        .store
        .list_messages(conversation_id)
        .await
        .map_err(|e| {
            error!("Error fetching messages for {}: {}", conversation_id, e);
            ProxyError::MessagesUnavailable
        })?;

    let model = request
        .model
        .unwrap_or_else(|| state.settings.default_model.clone());
    let system_prompt = conversation
        .system_prompt
        .as_deref()
        .unwrap_or(&state.settings.system_prompt);
    info!(
        %conversation_id,
        "Streaming {} messages to model {}",
        history.len(),
        model
    );

    let payload = GatewayRequest::streaming(model, system_prompt, &history);
    let upstream = json_request(&state.settings.gateway_url, gateway_key, &payload)
        .ok_or(ProxyError::ChatFailed)?;

    let response = state.http_client.request(upstream).await.map_err(|e| {
        error!("Error calling chat gateway: {}", e);
        ProxyError::ChatFailed
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ProxyError::RateLimited,
            StatusCode::PAYMENT_REQUIRED => ProxyError::PaymentRequired,
            _ => {
                let body = read_error_body(response.into_body()).await;
                error!("AI gateway error: {} {}", status, body);
                ProxyError::Gateway
            }
        });
    }

    Ok((
        StatusCode::OK,
        cors_headers(),
        [(header::CONTENT_TYPE, "text/event-stream")],
        response.into_body(),
    )
        .into_response())
}

#[instrument(skip(state, headers, body))]
pub async fn text_to_speech<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request: SpeechRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!("Rejecting text-to-speech body: {}", e);
        ProxyError::InvalidInput
    })?;

    let Some(speech_key) = state.settings.speech_key.as_deref() else {
        error!("Speech API key is not configured");
        return Err(ProxyError::SpeechFailed);
    };

    if !is_authorized(state.settings.keys.as_ref(), &headers) {
        return Err(ProxyError::Unauthorized);
    }

    info!("Generating speech for text length: {}", request.text.len());
    let payload = UpstreamSpeechRequest {
        model: SPEECH_MODEL,
        input: &request.text,
        voice: request.voice.as_deref().unwrap_or(DEFAULT_VOICE),
        response_format: SPEECH_FORMAT,
    };
    let upstream = json_request(&state.settings.speech_url, speech_key, &payload)
        .ok_or(ProxyError::SpeechFailed)?;

    let response = state.http_client.request(upstream).await.map_err(|e| {
        error!("Error calling speech upstream: {}", e);
        ProxyError::SpeechFailed
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = read_error_body(response.into_body()).await;
        error!("Speech upstream error: {} {}", status, body);
        return Err(ProxyError::SpeechUpstream);
    }

    let audio = axum::body::to_bytes(response.into_body(), AUDIO_BODY_LIMIT)
        .await
        .map_err(|e| {
            error!("Error reading speech audio: {}", e);
            ProxyError::SpeechFailed
        })?;
    debug!("Speech generation successful ({} bytes)", audio.len());

    let body = SpeechResponse {
        audio_content: BASE64.encode(&audio),
    };
    Ok((cors_headers(), Json(body)).into_response())
}

/// Build an authenticated JSON POST to an upstream.
fn json_request<B: serde::Serialize>(
    url: &Url,
    key: &str,
    payload: &B,
) -> Option<axum::extract::Request> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize upstream request: {}", e);
            return None;
        }
    };

    axum::http::Request::builder()
        .method(Method::POST)
        .uri(url.as_str())
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| error!("Failed to build upstream request to {}: {}", url, e))
        .ok()
}

async fn read_error_body(body: Body) -> String {
    match axum::body::to_bytes(body, ERROR_BODY_LIMIT).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewConversation, Role};
    use crate::store::{ChatStore, InMemoryStore};
    use crate::test_utils::{MockHttpClient, test_settings};
    use crate::{ProxySettings, build_router};
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use uuid::Uuid;

    const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

    async fn seeded_store() -> (Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let conversation = store
            .create_conversation(NewConversation {
                user_id: Uuid::new_v4(),
                title: "t".into(),
                model: "openai/gpt-5".into(),
                system_prompt: None,
            })
            .await
            .unwrap();
        store
            .insert_message(conversation.id, Role::User, "Hello")
            .await
            .unwrap();
        (store, conversation.id)
    }

    fn server(
        settings: ProxySettings,
        store: Arc<InMemoryStore>,
        client: MockHttpClient,
    ) -> TestServer {
        let state = AppState::with_client(settings, store, client);
        TestServer::new(build_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_chat_stream_relays_sse_body() {
        let (store, conversation_id) = seeded_store().await;
        let client = MockHttpClient::new_streaming(
            StatusCode::OK,
            vec![SSE_BODY[..20].to_string(), SSE_BODY[20..].to_string()],
        );
        let server = server(test_settings(), store, client.clone());

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": conversation_id}))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), "text/event-stream");
        assert_eq!(response.header("access-control-allow-origin"), "*");
        assert_eq!(response.text(), SSE_BODY);

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "https://gateway.test/v1/chat/completions");
        assert!(
            requests[0]
                .headers
                .contains(&("authorization".into(), "Bearer gateway-key".into()))
        );
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            sent,
            json!({
                "model": "google/gemini-2.5-flash",
                "messages": [
                    {"role": "system", "content": "You are a helpful AI assistant. Keep answers clear and concise."},
                    {"role": "user", "content": "Hello"}
                ],
                "stream": true
            })
        );
    }

    #[tokio::test]
    async fn test_chat_stream_uses_requested_model_and_conversation_prompt() {
        let store = Arc::new(InMemoryStore::new());
        let conversation = store
            .create_conversation(NewConversation {
                user_id: Uuid::new_v4(),
                title: "t".into(),
                model: "openai/gpt-5".into(),
                system_prompt: Some("Talk like a pirate.".into()),
            })
            .await
            .unwrap();
        let client = MockHttpClient::new_streaming(StatusCode::OK, vec![SSE_BODY.into()]);
        let server = server(test_settings(), store, client.clone());

        server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": conversation.id, "model": "openai/gpt-5-nano"}))
            .await;

        let sent: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
        assert_eq!(sent["model"], "openai/gpt-5-nano");
        assert_eq!(sent["messages"][0]["content"], "Talk like a pirate.");
        assert_eq!(sent["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chat_stream_invalid_body() {
        let (store, _) = seeded_store().await;
        let server = server(test_settings(), store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": "not-a-uuid"}))
            .await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(response.json::<Value>()["error"], "Invalid input parameters");
    }

    #[tokio::test]
    async fn test_chat_stream_requires_authorization() {
        let (store, conversation_id) = seeded_store().await;
        let client = MockHttpClient::new(StatusCode::OK, "");
        let server = server(test_settings(), store, client.clone());

        let response = server
            .post(CHAT_STREAM_PATH)
            .json(&json!({"conversation_id": conversation_id}))
            .await;

        assert_eq!(response.status_code(), 401);
        assert!(client.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_chat_stream_checks_configured_keys() {
        let (store, conversation_id) = seeded_store().await;
        let mut settings = test_settings();
        settings.keys = Some([crate::auth::ApiKey::from("pk-allowed")].into_iter().collect());
        let server = server(settings, store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": conversation_id}))
            .await;

        assert_eq!(response.status_code(), 401);
    }

    #[tokio::test]
    async fn test_chat_stream_unknown_conversation() {
        let (store, _) = seeded_store().await;
        let server = server(test_settings(), store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": Uuid::new_v4()}))
            .await;

        assert_eq!(response.status_code(), 404);
        assert_eq!(
            response.json::<Value>()["error"],
            "Conversation not found or access denied"
        );
    }

    #[tokio::test]
    async fn test_chat_stream_without_gateway_key() {
        let (store, conversation_id) = seeded_store().await;
        let mut settings = test_settings();
        settings.gateway_key = None;
        let server = server(settings, store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": conversation_id}))
            .await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(
            response.json::<Value>()["error"],
            "Failed to process chat request"
        );
    }

    #[rstest::rstest]
    #[case(StatusCode::TOO_MANY_REQUESTS, 429, "Rate limits exceeded, please try again later.")]
    #[case(
        StatusCode::PAYMENT_REQUIRED,
        402,
        "Payment required, please add funds to your AI gateway workspace."
    )]
    #[case(StatusCode::BAD_GATEWAY, 500, "AI gateway error")]
    #[case(StatusCode::UNAUTHORIZED, 500, "AI gateway error")]
    #[tokio::test]
    async fn test_chat_stream_gateway_errors(
        #[case] upstream: StatusCode,
        #[case] expected: u16,
        #[case] message: &str,
    ) {
        let (store, conversation_id) = seeded_store().await;
        let client = MockHttpClient::new(upstream, r#"{"error": "upstream says no"}"#);
        let server = server(test_settings(), store, client);

        let response = server
            .post(CHAT_STREAM_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"conversation_id": conversation_id}))
            .await;

        assert_eq!(response.status_code(), expected);
        assert_eq!(response.json::<Value>()["error"], message);
    }

    #[tokio::test]
    async fn test_preflight_requests() {
        let (store, _) = seeded_store().await;
        let server = server(test_settings(), store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server.method(Method::OPTIONS, CHAT_STREAM_PATH).await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(
            response.header("access-control-allow-headers"),
            ALLOWED_HEADERS
        );

        let response = server.method(Method::OPTIONS, SPEECH_PATH).await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "ok");
    }

    #[tokio::test]
    async fn test_text_to_speech_returns_base64_audio() {
        let (store, _) = seeded_store().await;
        let client = MockHttpClient::new(StatusCode::OK, "ID3audio");
        let server = server(test_settings(), store, client.clone());

        let response = server
            .post(SPEECH_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"text": "Read this aloud"}))
            .await;

        assert_eq!(response.status_code(), 200);
        let body: SpeechResponse = response.json();
        assert_eq!(BASE64.decode(body.audio_content).unwrap(), b"ID3audio");

        let requests = client.get_requests();
        assert_eq!(requests[0].uri, "https://speech.test/v1/audio/speech");
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            sent,
            json!({
                "model": "tts-1",
                "input": "Read this aloud",
                "voice": "alloy",
                "response_format": "mp3"
            })
        );
    }

    #[tokio::test]
    async fn test_text_to_speech_upstream_failure() {
        let (store, _) = seeded_store().await;
        let client = MockHttpClient::new(StatusCode::BAD_REQUEST, r#"{"error": "bad voice"}"#);
        let server = server(test_settings(), store, client);

        let response = server
            .post(SPEECH_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"text": "hi", "voice": "nova"}))
            .await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(response.json::<Value>()["error"], "Failed to generate speech");
    }

    #[tokio::test]
    async fn test_text_to_speech_without_key() {
        let (store, _) = seeded_store().await;
        let mut settings = test_settings();
        settings.speech_key = None;
        let server = server(settings, store, MockHttpClient::new(StatusCode::OK, ""));

        let response = server
            .post(SPEECH_PATH)
            .add_header("authorization", "Bearer pk")
            .json(&json!({"text": "hi"}))
            .await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(
            response.json::<Value>()["error"],
            "Failed to process text-to-speech request"
        );
    }
}
