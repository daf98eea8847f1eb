//! OpenAI Responses API adapter.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::models::Provider;
use tracing::debug;

use super::{
    AdapterError, AdapterRequest, AdapterResult, DeltaStream, StreamAdapter, StreamDelta,
    endpoint,
    history::{self, Turn},
    send_checked, sse,
};

const REASONING_MODELS: [&str; 7] = [
    "gpt-5",
    "gpt-5-mini",
    "gpt-5-nano",
    "o3",
    "o3-mini",
    "o3-pro",
    "o4-mini",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct Reasoning {
    effort: &'static str,
    summary: &'static str,
}

fn reasoning_for(model: &str) -> Option<Reasoning> {
    REASONING_MODELS.contains(&model).then_some(Reasoning {
        effort: "low",
        summary: "auto",
    })
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<Turn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    stream: bool,
    store: bool,
    truncation: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<Reasoning>,
}

#[derive(Debug, Deserialize)]
struct ResponsesEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    response: Option<ResponseState>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseState {
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ResponseFailure>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseFailure {
    message: String,
}

/// Streams `POST {base}/v1/responses`.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl StreamAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
        let body = ResponsesRequest {
            model: &request.model,
            input: history::turns(request),
            instructions: history::instructions(request),
            stream: true,
            store: false,
            truncation: "auto",
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            reasoning: reasoning_for(&request.model),
        };

        let response = send_checked(
            Provider::OpenAi,
            self.client
                .post(endpoint(&self.base_url, "/v1/responses"))
                .bearer_auth(&request.api_key)
                .json(&body),
        )
        .await?;

        let mut frames = sse::frames(response);
        Ok(try_stream! {
            let mut text_done = false;
            while let Some(frame) = frames.next().await {
                let frame = frame?;
                if frame.is_done() {
                    break;
                }
                let event: ResponsesEvent = frame.json()?;
                match event.kind.as_str() {
                    "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                        if let Some(delta) = event.delta {
                            yield StreamDelta::Thinking(delta);
                        }
                    }
                    "response.output_text.delta" => {
                        if let Some(delta) = event.delta {
                            yield StreamDelta::Content(delta);
                        }
                    }
                    "response.output_text.done" => text_done = true,
                    "response.completed" => {
                        let usage = event
                            .response
                            .and_then(|state| state.usage)
                            .and_then(|usage| usage.total_tokens);
                        yield StreamDelta::Finish { usage };
                        return;
                    }
                    "error" => {
                        Err::<(), _>(AdapterError::Stream {
                            provider: Provider::OpenAi,
                            message: event.message.unwrap_or_else(|| "unknown error".to_string()),
                        })?;
                    }
                    "response.failed" => {
                        let message = event
                            .response
                            .and_then(|state| state.error)
                            .map_or_else(|| "response failed".to_string(), |failure| failure.message);
                        Err::<(), _>(AdapterError::Stream { provider: Provider::OpenAi, message })?;
                    }
                    other => debug!(event = other, "ignoring responses event"),
                }
            }

            // Text finished but the stream closed before `response.completed`.
            if text_done {
                yield StreamDelta::Finish { usage: None };
            }
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{Upstream, collect, content, sse_body};
    use serde_json::json;

    fn request(model: &str) -> AdapterRequest {
        AdapterRequest {
            provider: Provider::OpenAi,
            model: model.into(),
            api_key: "sk-test".into(),
            prompt: "Say hi".into(),
            temperature: Some(0.5),
            is_new_chat: true,
            ..AdapterRequest::default()
        }
    }

    #[test]
    fn reasoning_applies_to_reasoning_models_only() {
        assert!(reasoning_for("o4-mini").is_some());
        assert!(reasoning_for("gpt-5").is_some());
        assert!(reasoning_for("gpt-4o-mini").is_none());
    }

    #[tokio::test]
    async fn streams_thinking_then_content_then_finish() {
        let body = sse_body(&[
            (
                Some("response.reasoning_summary_text.delta"),
                json!({ "type": "response.reasoning_summary_text.delta", "delta": "pondering" }),
            ),
            (
                Some("response.output_text.delta"),
                json!({ "type": "response.output_text.delta", "delta": "Hi" }),
            ),
            (
                Some("response.output_text.delta"),
                json!({ "type": "response.output_text.delta", "delta": " there" }),
            ),
            (
                Some("response.output_text.done"),
                json!({ "type": "response.output_text.done", "text": "Hi there" }),
            ),
            (
                Some("response.completed"),
                json!({ "type": "response.completed", "response": { "usage": { "total_tokens": 42 } } }),
            ),
        ]);
        let upstream = Upstream::start("/v1/responses", 200, body).await;
        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &upstream.uri());

        let deltas = collect(adapter.open(&request("o4-mini")).await.unwrap()).await;

        assert_eq!(deltas[0].as_ref().unwrap(), &StreamDelta::Thinking("pondering".into()));
        assert_eq!(content(&deltas), "Hi there");
        assert_eq!(
            deltas.last().unwrap().as_ref().unwrap(),
            &StreamDelta::Finish { usage: Some(42) }
        );

        let sent = upstream.request_body();
        assert_eq!(sent["model"], "o4-mini");
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["store"], false);
        assert_eq!(sent["truncation"], "auto");
        assert_eq!(sent["reasoning"], json!({ "effort": "low", "summary": "auto" }));
        assert_eq!(sent["input"], json!([{ "role": "user", "content": "Say hi" }]));
        assert!(sent.get("instructions").is_none());
        assert_eq!(
            upstream.received_header("authorization").await.as_deref(),
            Some("Bearer sk-test")
        );
    }

    #[tokio::test]
    async fn output_text_done_without_completed_still_finishes() {
        let body = sse_body(&[
            (None, json!({ "type": "response.output_text.delta", "delta": "ok" })),
            (None, json!({ "type": "response.output_text.done" })),
        ]);
        let upstream = Upstream::start("/v1/responses", 200, body).await;
        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &upstream.uri());

        let deltas = collect(adapter.open(&request("gpt-4o")).await.unwrap()).await;
        assert_eq!(
            deltas.last().unwrap().as_ref().unwrap(),
            &StreamDelta::Finish { usage: None }
        );
    }

    #[tokio::test]
    async fn error_event_surfaces_as_stream_error() {
        let body = sse_body(&[
            (None, json!({ "type": "response.output_text.delta", "delta": "par" })),
            (None, json!({ "type": "error", "message": "overloaded" })),
        ]);
        let upstream = Upstream::start("/v1/responses", 200, body).await;
        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &upstream.uri());

        let deltas = collect(adapter.open(&request("gpt-4o")).await.unwrap()).await;
        let err = deltas.last().unwrap().as_ref().unwrap_err();
        assert_eq!(err.to_string(), "OpenAI stream error: overloaded");
    }

    #[tokio::test]
    async fn rejected_request_reports_status_and_body() {
        let upstream = Upstream::start("/v1/responses", 401, "bad key").await;
        let adapter = OpenAiAdapter::new(reqwest::Client::new(), &upstream.uri());

        let Err(err) = adapter.open(&request("gpt-4o")).await else {
            panic!("expected upstream error");
        };
        assert_eq!(err.to_string(), "OpenAI API error (401 Unauthorized): bad key");
    }
}
