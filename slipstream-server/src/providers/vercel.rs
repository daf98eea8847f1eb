//! Vercel v0 chat-completions adapter.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::models::Provider;

use super::{
    AdapterRequest, AdapterResult, DeltaStream, StreamAdapter, StreamDelta, endpoint,
    history::{self, Turn},
    send_checked, sse,
};

const FULL_STACK_PROMPT: &str = "You are a knowledgeable full-stack expert; **without using any tools** provide assistance by outputting formatted code blocks into chat; tools such as QuickEdit are not to be used and are unnecessary for this.\n\nNote: Previous responses may be tagged with their source model for context in the form of [PROVIDER/MODEL] notation.";

/// v0 gets its own system prompt on continuing chats; new chats carry only the
/// caller's prompt.
fn system_text(request: &AdapterRequest) -> Option<String> {
    let system_prompt = request
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty());

    if request.is_new_chat {
        return system_prompt.map(str::to_string);
    }
    Some(system_prompt.map_or_else(
        || FULL_STACK_PROMPT.to_string(),
        |prompt| format!("{prompt}\n\n{FULL_STACK_PROMPT}"),
    ))
}

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<Turn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

/// Streams `POST {base}/v1/chat/completions` on the v0 API.
#[derive(Debug, Clone)]
pub struct VercelAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl VercelAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

/// New reasoning text in `incoming`, given everything emitted so far.
///
/// Some v0 models resend the whole reasoning text on every frame; only the
/// unseen suffix is returned for those. Incremental frames pass through.
fn reasoning_suffix(seen: &mut String, incoming: String) -> Option<String> {
    if !seen.is_empty() && incoming.starts_with(seen.as_str()) {
        let fresh = incoming[seen.len()..].to_string();
        *seen = incoming;
        return (!fresh.is_empty()).then_some(fresh);
    }
    seen.push_str(&incoming);
    (!incoming.is_empty()).then_some(incoming)
}

#[async_trait]
impl StreamAdapter for VercelAdapter {
    fn provider(&self) -> Provider {
        Provider::Vercel
    }

    async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
        let body = CompletionsRequest {
            model: &request.model,
            messages: history::chat_messages(request, system_text(request)),
            stream: true,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
        };

        let response = send_checked(
            Provider::Vercel,
            self.client
                .post(endpoint(&self.base_url, "/v1/chat/completions"))
                .bearer_auth(&request.api_key)
                .json(&body),
        )
        .await?;

        let mut frames = sse::frames(response);
        Ok(try_stream! {
            let mut reasoning = String::new();
            while let Some(frame) = frames.next().await {
                let frame = frame?;
                if frame.is_done() {
                    yield StreamDelta::Finish { usage: None };
                    return;
                }

                let chunk: CompletionChunk = frame.json()?;
                let choices = chunk.choices.unwrap_or_default();
                if choices.is_empty() {
                    if let Some(usage) = chunk.usage {
                        yield StreamDelta::Finish { usage: usage.total_tokens };
                        return;
                    }
                    continue;
                }

                for choice in choices {
                    if let Some(text) = choice.delta.reasoning_content {
                        if let Some(fresh) = reasoning_suffix(&mut reasoning, text) {
                            yield StreamDelta::Thinking(fresh);
                        }
                    } else if let Some(content) = choice.delta.content {
                        yield StreamDelta::Content(content);
                    }
                }
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

    #[test]
    fn continuing_chats_get_the_full_stack_prompt() {
        let mut request = AdapterRequest {
            system_prompt: Some("Use Rust".into()),
            is_new_chat: true,
            ..AdapterRequest::default()
        };
        assert_eq!(system_text(&request).as_deref(), Some("Use Rust"));

        request.is_new_chat = false;
        assert_eq!(
            system_text(&request).unwrap(),
            format!("Use Rust\n\n{FULL_STACK_PROMPT}")
        );

        request.system_prompt = None;
        assert_eq!(system_text(&request).unwrap(), FULL_STACK_PROMPT);
    }

    #[test]
    fn cumulative_reasoning_yields_only_new_text() {
        let mut seen = String::new();
        assert_eq!(reasoning_suffix(&mut seen, "Plan".into()).as_deref(), Some("Plan"));
        assert_eq!(reasoning_suffix(&mut seen, "Plan the".into()).as_deref(), Some(" the"));
        assert_eq!(reasoning_suffix(&mut seen, "Plan the".into()), None);
        assert_eq!(reasoning_suffix(&mut seen, " app".into()).as_deref(), Some(" app"));
        assert_eq!(seen, "Plan the app");
    }

    #[tokio::test]
    async fn resent_reasoning_is_not_duplicated() {
        let body = sse_body(&[
            (None, json!({ "choices": [{ "delta": { "reasoning_content": "Think" } }] })),
            (None, json!({ "choices": [{ "delta": { "reasoning_content": "Thinking hard" } }] })),
            (None, json!({ "choices": [{ "delta": { "content": "ok" } }] })),
            (None, json!({ "choices": [], "usage": { "total_tokens": 2 } })),
        ]);
        let upstream = Upstream::start("/v1/chat/completions", 200, body).await;
        let adapter = VercelAdapter::new(reqwest::Client::new(), &upstream.uri());

        let deltas = collect(adapter.open(&AdapterRequest::default()).await.unwrap()).await;
        let thinking: Vec<_> = deltas
            .iter()
            .filter_map(|delta| match delta {
                Ok(StreamDelta::Thinking(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, vec!["Think", "ing hard"]);
        assert_eq!(content(&deltas), "ok");
    }

    #[tokio::test]
    async fn usage_chunk_with_empty_choices_finishes() {
        let body = sse_body(&[
            (None, json!({ "choices": [{ "index": 0, "delta": { "reasoning_content": "plan" } }] })),
            (None, json!({ "choices": [{ "index": 0, "delta": { "content": "```rs" } }] })),
            (None, json!({ "choices": [], "usage": { "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 } })),
        ]);
        let upstream = Upstream::start("/v1/chat/completions", 200, body).await;
        let adapter = VercelAdapter::new(reqwest::Client::new(), &upstream.uri());
        let request = AdapterRequest {
            provider: Provider::Vercel,
            model: "v0-1.5-md".into(),
            api_key: "v0".into(),
            prompt: "scaffold".into(),
            ..AdapterRequest::default()
        };

        let deltas = collect(adapter.open(&request).await.unwrap()).await;
        assert_eq!(deltas[0].as_ref().unwrap(), &StreamDelta::Thinking("plan".into()));
        assert_eq!(content(&deltas), "```rs");
        assert_eq!(
            deltas.last().unwrap().as_ref().unwrap(),
            &StreamDelta::Finish { usage: Some(7) }
        );

        let sent = upstream.request_body();
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1], json!({ "role": "user", "content": "scaffold" }));
    }

    #[tokio::test]
    async fn done_marker_finishes() {
        let body = format!(
            "{}data: [DONE]\n\n",
            sse_body(&[(None, json!({ "choices": [{ "delta": { "content": "x" } }] }))])
        );
        let upstream = Upstream::start("/v1/chat/completions", 200, body).await;
        let adapter = VercelAdapter::new(reqwest::Client::new(), &upstream.uri());

        let deltas = collect(adapter.open(&AdapterRequest::default()).await.unwrap()).await;
        assert_eq!(
            deltas.last().unwrap().as_ref().unwrap(),
            &StreamDelta::Finish { usage: None }
        );
    }
}
