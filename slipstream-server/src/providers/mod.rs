//! Upstream provider adapters.
//!
//! Every adapter turns one chat request into a [`DeltaStream`] of
//! provider-neutral [`StreamDelta`] values. The shared state machine in
//! [`crate::resolver::stream`] consumes that stream, so adapters only
//! know how to talk to their upstream API.

pub mod anthropic;
pub mod gemini;
pub mod history;
pub mod meta;
pub mod openai;
pub mod sse;
pub mod vercel;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{RequestBuilder, Response, StatusCode};
use shared::{config::server::ProvidersSection, models::Provider};
use thiserror::Error;
use tracing::warn;

use crate::{resolver::errors::safe_value_message, services::persistence::StoredMessage};

/// Errors raised while opening or consuming an upstream stream.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{} API error ({status}): {body}", .provider.display_name())]
    Upstream {
        provider: Provider,
        status: StatusCode,
        body: String,
    },
    #[error("{} stream error: {message}", .provider.display_name())]
    Stream { provider: Provider, message: String },
    #[error("failed to decode upstream event: {0}")]
    Decode(String),
    #[error("no API key configured for {}", .0.display_name())]
    MissingApiKey(Provider),
    /// No response headers, or no delta, within the configured window.
    #[error("upstream sent nothing for {:?}", .0)]
    Timeout(Duration),
    #[error("upstream stream ended without a terminal event")]
    StreamEnded,
    #[error("provider {0} is not available")]
    Unsupported(Provider),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One provider-neutral step of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Thinking(String),
    Content(String),
    InlineData {
        data: String,
        mime_type: Option<String>,
    },
    /// Terminal signal, optionally with the total token count.
    Finish { usage: Option<u64> },
}

pub type DeltaStream = BoxStream<'static, AdapterResult<StreamDelta>>;

/// Everything an adapter needs to open one upstream stream.
#[derive(Debug, Clone, Default)]
pub struct AdapterRequest {
    pub provider: Provider,
    pub model: String,
    pub user_id: String,
    pub api_key: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Prior turns, oldest first, excluding the current prompt.
    pub history: Vec<StoredMessage>,
    pub is_new_chat: bool,
}

/// Provider-specific streaming client.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Sends the upstream request and returns the decoded delta stream.
    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream>;
}

/// Maps each [`Provider`] to the adapter that serves it.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn StreamAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self.adapters.keys().map(|p| p.as_str()).collect();
        providers.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the HTTP adapter of every provider against the configured base URLs.
    #[must_use]
    pub fn from_config(client: &reqwest::Client, providers: &ProvidersSection) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(openai::OpenAiAdapter::new(
            client.clone(),
            &providers.openai.base_url,
        )));
        registry.register(Arc::new(anthropic::AnthropicAdapter::anthropic(
            client.clone(),
            &providers.anthropic.base_url,
        )));
        registry.register(Arc::new(anthropic::AnthropicAdapter::grok(
            client.clone(),
            &providers.grok.base_url,
        )));
        registry.register(Arc::new(gemini::GeminiAdapter::new(
            client.clone(),
            &providers.gemini.base_url,
        )));
        registry.register(Arc::new(vercel::VercelAdapter::new(
            client.clone(),
            &providers.vercel.base_url,
        )));
        registry.register(Arc::new(meta::MetaAdapter::new(
            client.clone(),
            &providers.meta.base_url,
        )));
        registry
    }

    /// Adds or replaces the adapter for its provider.
    pub fn register(&mut self, adapter: Arc<dyn StreamAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    /// # Errors
    /// Returns [`AdapterError::Unsupported`] when nothing is registered for `provider`.
    pub fn get(&self, provider: Provider) -> AdapterResult<Arc<dyn StreamAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(AdapterError::Unsupported(provider))
    }
}

/// Sends an upstream request and turns non-success statuses into
/// [`AdapterError::Upstream`] carrying the response body.
pub(crate) async fn send_checked(
    provider: Provider,
    request: RequestBuilder,
) -> AdapterResult<Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    warn!(provider = %provider, status = %status, "upstream rejected request");
    Err(AdapterError::Upstream {
        provider,
        status,
        body: upstream_error_text(&raw),
    })
}

/// Pulls `error.message` out of a JSON error body; anything else is passed through.
fn upstream_error_text(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => {
            let detail = value.get("error").unwrap_or(&value);
            safe_value_message(detail.get("message").unwrap_or(detail))
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Joins a configured base URL and an API path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
