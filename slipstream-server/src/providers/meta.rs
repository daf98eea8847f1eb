//! Meta Llama API adapter.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::models::Provider;
use tracing::trace;

use super::{
    AdapterRequest, AdapterResult, DeltaStream, StreamAdapter, StreamDelta, endpoint,
    history::{self, Turn},
    send_checked, sse,
};

#[derive(Debug, Serialize)]
struct LlamaRequest<'a> {
    model: &'a str,
    messages: Vec<Turn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct LlamaChunk {
    event: LlamaEvent,
}

#[derive(Debug, Deserialize)]
struct LlamaEvent {
    event_type: String,
    #[serde(default)]
    delta: Option<LlamaDelta>,
    #[serde(default)]
    metrics: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
struct LlamaDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    metric: String,
    value: f64,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn total_tokens(metrics: &[Metric]) -> Option<u64> {
    metrics
        .iter()
        .find(|metric| metric.metric == "num_total_tokens")
        .map(|metric| metric.value.max(0.0).round() as u64)
}

/// Streams `POST {base}/v1/chat/completions` on the Llama API.
#[derive(Debug, Clone)]
pub struct MetaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl MetaAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl StreamAdapter for MetaAdapter {
    fn provider(&self) -> Provider {
        Provider::Meta
    }

    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
        let body = LlamaRequest {
            model: &request.model,
            messages: history::chat_messages(request, history::instructions(request)),
            stream: true,
            temperature: request.temperature,
            top_p: request.top_p,
            max_completion_tokens: request.max_tokens,
            user: &request.user_id,
        };

        let response = send_checked(
            Provider::Meta,
            self.client
                .post(endpoint(&self.base_url, "/v1/chat/completions"))
                .bearer_auth(&request.api_key)
                .json(&body),
        )
        .await?;

        let mut frames = sse::frames(response);
        Ok(try_stream! {
            while let Some(frame) = frames.next().await {
                let frame = frame?;
                if frame.is_done() {
                    break;
                }
                let LlamaChunk { event } = frame.json()?;

                if let Some(delta) = event.delta {
                    match delta.kind.as_str() {
                        "text" => {
                            if let Some(text) = delta.text {
                                yield StreamDelta::Content(text);
                            }
                        }
                        "reasoning" => {
                            if let Some(reasoning) = delta.reasoning.or(delta.text) {
                                yield StreamDelta::Thinking(reasoning);
                            }
                        }
                        other => trace!(kind = other, "ignoring llama delta"),
                    }
                }

                if event.event_type == "complete" {
                    yield StreamDelta::Finish { usage: total_tokens(&event.metrics) };
                    return;
                }
            }
        }
        .boxed())
    }
}
