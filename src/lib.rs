//! Flashchat - streaming chat replies from an SSE gateway
//!
//! The library has two halves that meet at the chat-stream endpoint:
//!
//! - The proxy side ([`build_router`], [`handlers`]) accepts a conversation
//!   id, forwards the conversation to a chat-completion gateway and relays the
//!   SSE response. A text-to-speech endpoint sits next to it.
//! - The client side ([`session::ChatSession`]) calls that endpoint, decodes
//!   the SSE body incrementally ([`sse`]) and reconciles the streamed reply
//!   with its persisted message ([`reconciler`]).

use axum::Router;
use axum::routing::post;
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};
use url::Url;

pub mod auth;
pub mod client;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod reconciler;
pub mod session;
pub mod sse;
pub mod store;

use auth::KeySet;
use client::{HttpClient, HyperClient, PoolConfig};
use handlers::{
    CHAT_STREAM_PATH, SPEECH_PATH, chat_stream, chat_stream_preflight, speech_preflight,
    text_to_speech,
};
use models::{DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT};
use store::ChatStore;

/// Upstream endpoints and credentials used by the proxy handlers.
#[derive(Debug, Clone, Builder)]
pub struct ProxySettings {
    pub gateway_url: Url,
    /// Requests to the chat endpoint fail with 500 while this is unset.
    pub gateway_key: Option<String>,
    pub speech_url: Url,
    pub speech_key: Option<String>,
    #[builder(default = DEFAULT_MODEL.to_string())]
    pub default_model: String,
    #[builder(default = DEFAULT_SYSTEM_PROMPT.to_string())]
    pub system_prompt: String,
    /// Accepted client bearer tokens. Any bearer token is accepted when unset.
    pub keys: Option<KeySet>,
}

/// The proxy's application state: HTTP client, conversation store and settings
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub store: Arc<dyn ChatStore>,
    pub settings: Arc<ProxySettings>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: ProxySettings, store: Arc<dyn ChatStore>, pool: PoolConfig) -> Self {
        Self::with_client(settings, store, client::create_hyper_client(pool))
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: ProxySettings, store: Arc<dyn ChatStore>, http_client: T) -> Self {
        Self {
            http_client,
            store,
            settings: Arc::new(settings),
        }
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/functions/v1/chat-stream` - Streams a conversation reply from the gateway
/// - `/functions/v1/text-to-speech` - Returns synthesized speech as base64
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route(
            CHAT_STREAM_PATH,
            post(chat_stream).options(chat_stream_preflight),
        )
        .route(SPEECH_PATH, post(text_to_speech).options(speech_preflight))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name. The recorder is global, so
/// this can only be called once per process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
