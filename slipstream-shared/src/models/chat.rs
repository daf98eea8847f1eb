use serde::{Deserialize, Serialize};

/// Conversation id a client sends before the conversation exists.
pub const NEW_CHAT_SENTINEL: &str = "new-chat";

/// Returns `true` when the id still refers to a conversation that has not been minted.
#[must_use]
pub fn is_new_chat(conversation_id: &str) -> bool {
    conversation_id.starts_with(NEW_CHAT_SENTINEL)
}

/// Upstream model vendors the resolver can route a chat request to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Gemini,
    Anthropic,
    Grok,
    Vercel,
    Meta,
}

impl Provider {
    /// Every provider the registry knows about.
    pub const ALL: [Self; 6] = [
        Self::OpenAi,
        Self::Gemini,
        Self::Anthropic,
        Self::Grok,
        Self::Vercel,
        Self::Meta,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::Grok => "grok",
            Self::Vercel => "vercel",
            Self::Meta => "meta",
        }
    }

    /// Human readable vendor name, used as the fallback conversation title.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Anthropic => "Anthropic",
            Self::Grok => "Grok",
            Self::Vercel => "Vercel",
            Self::Meta => "Meta",
        }
    }

    /// Model used when the request does not name one.
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Gemini => "gemini-2.5-flash",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Grok => "grok-3",
            Self::Vercel => "v0-1.5-md",
            Self::Meta => "Llama-4-Maverick-17B-128E-Instruct-FP8",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Provider {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "anthropic" => Ok(Self::Anthropic),
            "grok" | "xai" => Ok(Self::Grok),
            "vercel" | "v0" => Ok(Self::Vercel),
            "meta" | "llama" => Ok(Self::Meta),
            _ => Err("invalid provider"),
        }
    }
}

/// Coarse location hints a client may attach to a chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestUserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

/// Inbound `ai_chat_request` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: String,
    pub prompt: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub has_provider_configured: bool,
    #[serde(default)]
    pub is_default_provider: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestUserMetadata>,
}

impl ChatRequest {
    /// Model named by the request, or the provider default when absent or blank.
    #[must_use]
    pub fn resolved_model(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map_or_else(|| self.provider.default_model().to_string(), str::to_string)
    }

    #[must_use]
    pub fn is_new_chat(&self) -> bool {
        is_new_chat(&self.conversation_id)
    }
}

/// Author of a stored conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderType {
    User,
    Ai,
}

impl SenderType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Ai => "AI",
        }
    }
}

impl TryFrom<&str> for SenderType {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "USER" => Ok(Self::User),
            "AI" => Ok(Self::Ai),
            _ => Err("invalid sender type"),
        }
    }
}
