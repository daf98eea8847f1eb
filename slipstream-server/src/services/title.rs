//! Conversation title generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{config::server::TitleSection, models::Provider};
use tracing::{debug, warn};

use crate::providers::{AdapterError, AdapterResult, endpoint, send_checked};

/// Title used when a generator returns nothing usable.
pub const FALLBACK_TITLE: &str = "New Chat";

/// Produces a short title for a conversation from its first prompt.
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    /// # Errors
    /// Returns the upstream failure; callers fall back to a provider name.
    async fn generate(&self, prompt: &str) -> AdapterResult<String>;
}

/// Normalizes raw model output into a title.
///
/// One leading and one trailing quote are removed, then a trailing period, and
/// the result is capped at `max_words` whitespace-separated words. Nothing left
/// over means [`FALLBACK_TITLE`].
#[must_use]
pub fn clean_title(raw: &str, max_words: usize) -> String {
    if raw.is_empty() {
        return FALLBACK_TITLE.to_string();
    }

    let is_quote = |c: char| c == '"' || c == '\'';
    let mut title = raw;
    if title.starts_with(is_quote) {
        title = &title[1..];
    }
    if title.ends_with(is_quote) {
        title = &title[..title.len() - 1];
    }
    let title = title.strip_suffix('.').unwrap_or(title);

    let words = title
        .split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>();
    if words.is_empty() {
        return FALLBACK_TITLE.to_string();
    }
    words.join(" ")
}

/// Title prompt sent to the completions endpoint.
#[must_use]
pub fn title_prompt(prompt: &str) -> String {
    format!(
        "Generate a concise, descriptive title (max 10 words) for this user-submitted-prompt: \"{prompt}\""
    )
}

#[derive(Debug, Serialize)]
struct TitleMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct TitleRequest<'a> {
    model: &'a str,
    store: bool,
    messages: [TitleMessage; 1],
}

#[derive(Debug, Deserialize)]
struct TitleResponse {
    #[serde(default)]
    choices: Vec<TitleChoice>,
}

#[derive(Debug, Deserialize)]
struct TitleChoice {
    message: TitleChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct TitleChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Asks an OpenAI chat-completions model for a title using the server key.
#[derive(Debug, Clone)]
pub struct OpenAiTitleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_words: usize,
}

impl OpenAiTitleGenerator {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        settings: &TitleSection,
    ) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            api_key,
            model: settings.model.clone(),
            max_words: settings.max_words,
        }
    }
}

#[async_trait]
impl TitleGenerator for OpenAiTitleGenerator {
    async fn generate(&self, prompt: &str) -> AdapterResult<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(AdapterError::MissingApiKey(Provider::OpenAi))?;

        let body = TitleRequest {
            model: &self.model,
            store: false,
            messages: [TitleMessage {
                role: "developer",
                content: title_prompt(prompt),
            }],
        };

        let response = send_checked(
            Provider::OpenAi,
            self.client
                .post(endpoint(&self.base_url, "/v1/chat/completions"))
                .bearer_auth(api_key)
                .json(&body),
        )
        .await?;

        let parsed: TitleResponse = response.json().await?;
        let raw = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if raw.trim().is_empty() {
            warn!("title model returned no content");
        }
        let title = clean_title(raw.trim(), self.max_words);
        debug!(title = %title, "generated conversation title");
        Ok(title)
    }
}
