//! Gemini `streamGenerateContent` adapter.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::models::Provider;

use super::{
    AdapterRequest, AdapterResult, DeltaStream, StreamAdapter, StreamDelta, endpoint,
    history::{self, Role},
    send_checked, sse,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: Option<u64>,
}

impl Part {
    fn into_delta(self) -> Option<StreamDelta> {
        if let Some(inline) = self.inline_data {
            return Some(StreamDelta::InlineData {
                data: inline.data,
                mime_type: inline.mime_type,
            });
        }
        let text = self.text?;
        Some(if self.thought {
            StreamDelta::Thinking(text)
        } else {
            StreamDelta::Content(text)
        })
    }
}

fn build_request(request: &AdapterRequest) -> GenerateRequest {
    let contents = history::turns(request)
        .into_iter()
        .map(|turn| Content {
            role: Some(match turn.role {
                Role::Assistant => "model",
                Role::User | Role::System => "user",
            }),
            parts: vec![TextPart { text: turn.content }],
        })
        .collect();

    GenerateRequest {
        contents,
        system_instruction: history::instructions(request).map(|text| Content {
            role: None,
            parts: vec![TextPart { text }],
        }),
        generation_config: GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            thinking_config: ThinkingConfig {
                include_thoughts: true,
            },
        },
    }
}

/// Streams `POST {base}/v1beta/models/{model}:streamGenerateContent?alt=sse`.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl StreamAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
        let url = endpoint(
            &self.base_url,
            &format!("/v1beta/models/{}:streamGenerateContent", request.model),
        );
        let response = send_checked(
            Provider::Gemini,
            self.client
                .post(url)
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", &request.api_key)
                .json(&build_request(request)),
        )
        .await?;

        let mut frames = sse::frames(response);
        Ok(try_stream! {
            while let Some(frame) = frames.next().await {
                let chunk: GenerateChunk = frame?.json()?;
                let usage = chunk.usage_metadata.and_then(|usage| usage.total_token_count);
                let Some(candidate) = chunk.candidates.into_iter().next() else {
                    continue;
                };

                for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                    if let Some(delta) = part.into_delta() {
                        yield delta;
                    }
                }

                if candidate.finish_reason.is_some() {
                    yield StreamDelta::Finish { usage };
                    return;
                }
            }
        }
        .boxed())
    }
}
