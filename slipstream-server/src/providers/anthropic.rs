//! Anthropic Messages API adapter, also used for xAI's compatible endpoint.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::models::Provider;
use tracing::{debug, info};

use super::{
    AdapterError, AdapterRequest, AdapterResult, DeltaStream, StreamAdapter, StreamDelta,
    endpoint,
    history::{self, Turn},
    send_checked, sse,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const THINKING_RESERVE: u32 = 1024;
const MIN_THINKING_MAX_TOKENS: u32 = 2048;

/// Which vendor the Messages endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vendor {
    Anthropic,
    Grok,
}

impl Vendor {
    const fn provider(self) -> Provider {
        match self {
            Self::Anthropic => Provider::Anthropic,
            Self::Grok => Provider::Grok,
        }
    }

    fn max_tokens(self, model: &str) -> u32 {
        match self {
            Self::Anthropic => match model {
                "claude-3-haiku-20240307" => 4096,
                "claude-3-5-haiku-20241022"
                | "claude-3-5-sonnet-20240620"
                | "claude-3-5-sonnet-20241022" => 8192,
                "claude-opus-4-20250514" | "claude-opus-4-1-20250805" => 32000,
                "claude-sonnet-4-20250514" | "claude-3-7-sonnet-20250219" => 64000,
                _ => 8192,
            },
            Self::Grok => match model {
                "grok-4-0709" => 256_000,
                "grok-2-image-1212" | "grok-2-vision-1212" => 32768,
                _ => 131_072,
            },
        }
    }

    fn supports_thinking(self, model: &str) -> bool {
        match self {
            Self::Anthropic => true,
            Self::Grok => !matches!(
                model,
                "grok-3" | "grok-3-fast" | "grok-2-image-1212" | "grok-2-vision-1212"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

/// Output cap and extended-thinking setting for one request.
///
/// A requested cap above the model limit is clamped to the limit. Thinking is
/// enabled when the model supports it and the cap leaves room for the minimum
/// budget.
fn token_settings(vendor: Vendor, model: &str, requested: Option<u32>) -> (u32, Option<Thinking>) {
    let limit = vendor.max_tokens(model);
    let max_tokens = requested
        .filter(|requested| *requested > 0 && *requested <= limit)
        .unwrap_or(limit);

    let thinking = (vendor.supports_thinking(model) && max_tokens >= MIN_THINKING_MAX_TOKENS)
        .then_some(Thinking {
            kind: "enabled",
            budget_tokens: max_tokens - THINKING_RESERVE,
        });
    (max_tokens, thinking)
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessagesEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    ThinkingDelta { thinking: String },
    TextDelta { text: String },
    CitationsDelta { citation: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Streams `POST {base}/v1/messages`.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    vendor: Vendor,
}

impl AnthropicAdapter {
    #[must_use]
    pub fn anthropic(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            vendor: Vendor::Anthropic,
        }
    }

    /// xAI serves Grok through an Anthropic-compatible Messages endpoint.
    #[must_use]
    pub fn grok(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            vendor: Vendor::Grok,
        }
    }
}

#[async_trait]
impl StreamAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        self.vendor.provider()
    }

    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
        let provider = self.vendor.provider();
        let (max_tokens, thinking) = token_settings(self.vendor, &request.model, request.max_tokens);
        let sampling = |value: Option<f64>| if thinking.is_some() { None } else { value };

        let body = MessagesRequest {
            model: &request.model,
            max_tokens,
            stream: true,
            messages: history::turns(request),
            system: history::instructions(request).map(|text| {
                vec![SystemBlock {
                    kind: "text",
                    text,
                }]
            }),
            thinking,
            temperature: sampling(request.temperature),
            top_p: sampling(request.top_p),
        };

        let response = send_checked(
            provider,
            self.client
                .post(endpoint(&self.base_url, "/v1/messages"))
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
        )
        .await?;

        let mut frames = sse::frames(response);
        Ok(try_stream! {
            let mut input_tokens = 0_u64;
            while let Some(frame) = frames.next().await {
                let frame = frame?;
                match frame.json::<MessagesEvent>()? {
                    MessagesEvent::MessageStart { message } => {
                        input_tokens = message.usage.unwrap_or_default().input_tokens;
                    }
                    MessagesEvent::ContentBlockDelta { delta } => match delta {
                        BlockDelta::ThinkingDelta { thinking } => {
                            yield StreamDelta::Thinking(thinking);
                        }
                        BlockDelta::TextDelta { text } => {
                            yield StreamDelta::Content(text);
                        }
                        BlockDelta::CitationsDelta { citation } => {
                            info!(provider = %provider, citation = %citation, "citation received");
                        }
                        BlockDelta::Other => {}
                    },
                    MessagesEvent::MessageDelta { delta, usage } => {
                        if let Some(stop_reason) = delta.stop_reason {
                            debug!(provider = %provider, stop_reason, "message finished");
                            let output_tokens = usage.unwrap_or_default().output_tokens;
                            let total = input_tokens + output_tokens;
                            yield StreamDelta::Finish { usage: (total > 0).then_some(total) };
                            return;
                        }
                    }
                    MessagesEvent::Error { error } => {
                        Err::<(), _>(AdapterError::Stream { provider, message: error.message })?;
                    }
                    MessagesEvent::Other => {}
                }
            }
        }
        .boxed())
    }
}
