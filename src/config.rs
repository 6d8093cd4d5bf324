//! Command-line and environment configuration for the proxy server
//!
//! Parsed with clap; every secret can also come from the environment so it
//! never has to appear on a command line.
use anyhow::anyhow;
use clap::Parser;
use flashchat::ProxySettings;
use flashchat::auth::{ApiKey, KeySet};
use flashchat::client::PoolConfig;
use flashchat::models::{DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "flashchat")]
    pub metrics_prefix: String,

    /// Chat-completion endpoint that replies are streamed from.
    #[arg(
        long,
        env = "CHAT_GATEWAY_URL",
        default_value = "https://ai.gateway.lovable.dev/v1/chat/completions"
    )]
    pub gateway_url: String,

    /// API key for the chat-completion gateway.
    #[arg(long, env = "CHAT_GATEWAY_API_KEY", hide_env_values = true)]
    pub gateway_key: Option<String>,

    /// Text-to-speech endpoint.
    #[arg(
        long,
        env = "SPEECH_URL",
        default_value = "https://api.openai.com/v1/audio/speech"
    )]
    pub speech_url: String,

    /// API key for the text-to-speech endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub speech_key: Option<String>,

    /// Model used when a request does not name one.
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub default_model: String,

    /// System prompt used when a conversation has none.
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    /// Bearer tokens accepted from clients. Any bearer token is accepted when empty.
    #[arg(
        long,
        env = "FLASHCHAT_API_KEYS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub api_keys: Vec<String>,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        parse_http_url("gateway-url", &self.gateway_url)?;
        parse_http_url("speech-url", &self.speech_url)?;
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default-model must not be empty"));
        }
        Ok(self)
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    pub fn settings(&self) -> Result<ProxySettings, anyhow::Error> {
        let keys: Option<KeySet> = if self.api_keys.is_empty() {
            None
        } else {
            Some(self.api_keys.iter().map(|k| ApiKey::from(k.as_str())).collect())
        };

        Ok(ProxySettings::builder()
            .gateway_url(parse_http_url("gateway-url", &self.gateway_url)?)
            .maybe_gateway_key(self.gateway_key.clone())
            .speech_url(parse_http_url("speech-url", &self.speech_url)?)
            .maybe_speech_key(self.speech_key.clone())
            .default_model(self.default_model.clone())
            .system_prompt(self.system_prompt.clone())
            .maybe_keys(keys)
            .build())
    }
}

fn parse_http_url(name: &str, value: &str) -> Result<Url, anyhow::Error> {
    let url = Url::parse(value).map_err(|e| anyhow!("Invalid {} '{}': {}", name, value, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(anyhow!(
            "Invalid {} '{}': unsupported scheme {}",
            name,
            value,
            scheme
        )),
    }
}
