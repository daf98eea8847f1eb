//! Provider-neutral stream state machine.
//!
//! Consumes a [`DeltaStream`] and turns it into wire events on both delivery
//! paths, periodic checkpoints, and the final persisted message.

use std::{sync::Arc, time::Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use serde::Serialize;
use shared::models::{
    Channel, ChatChunk, ChatError, ChatInlineData, ChatResponse, CheckpointMetadata,
    OutboundEvent, PersistedCheckpoint, StreamContext,
};
use tracing::{debug, error, info, warn};

use super::{connection::Connection, errors::safe_error_message};
use crate::{
    providers::{AdapterError, AdapterResult, DeltaStream, StreamDelta},
    services::{
        checkpoint_writer::CheckpointSession,
        fanout::FanoutChannel,
        persistence::{ConversationStore, FinalMessage},
    },
};

/// Aggregates for one stream.
#[derive(Debug, Default)]
pub struct StreamState {
    chunks: Vec<String>,
    thinking_chunks: Vec<String>,
    thinking_started: Option<Instant>,
    thinking_duration: Option<u64>,
    is_thinking: bool,
}

impl StreamState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    #[must_use]
    pub fn thinking_chunks(&self) -> &[String] {
        &self.thinking_chunks
    }

    /// Milliseconds between the first thinking delta and the first content
    /// delta after it. `None` while still thinking or when there was no thinking.
    #[must_use]
    pub const fn thinking_duration(&self) -> Option<u64> {
        self.thinking_duration
    }

    /// True between a thinking delta and the next content delta.
    #[must_use]
    pub const fn is_thinking(&self) -> bool {
        self.is_thinking
    }

    fn on_thinking(&mut self, text: String) {
        if self.thinking_started.is_none() {
            self.thinking_started = Some(Instant::now());
        }
        self.is_thinking = true;
        self.thinking_chunks.push(text);
    }

    fn on_content(&mut self, text: String) {
        if self.is_thinking {
            self.is_thinking = false;
            if self.thinking_duration.is_none() {
                let elapsed = self
                    .thinking_started
                    .map_or(0, |started| u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
                self.thinking_duration = Some(elapsed);
            }
        }
        self.chunks.push(text);
    }

    fn thinking_text(&self) -> Option<String> {
        (!self.thinking_chunks.is_empty()).then(|| self.thinking_chunks.concat())
    }
}

/// Everything one stream writes to.
#[derive(Clone)]
pub struct StreamSink {
    pub context: StreamContext,
    pub channel: Channel,
    pub connection: Connection,
    pub fanout: Arc<dyn FanoutChannel>,
    pub checkpoints: CheckpointSession,
    pub conversations: Arc<dyn ConversationStore>,
    pub checkpoint_interval: usize,
    /// Set when an unfinished checkpoint was replayed before this stream.
    pub resumed: bool,
}

impl std::fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("conversation_id", &self.context.conversation_id)
            .field("channel", &self.channel)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .finish_non_exhaustive()
    }
}

impl StreamSink {
    /// Sends one event to the requester and publishes it on the stream channel.
    ///
    /// The payload is serialized once; a closed connection does not stop the
    /// publish.
    pub async fn deliver<T: Serialize + ?Sized>(&self, event: &T) {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                warn!(conversation_id = %self.context.conversation_id, error = %err, "dropping unserializable stream event");
                return;
            }
        };
        self.connection.send_raw(Arc::clone(&payload)).await;
        self.fanout.publish_raw(&self.channel, payload).await;
    }

    fn checkpoint(&self, state: &StreamState, completed: bool) -> PersistedCheckpoint {
        PersistedCheckpoint {
            chunks: state.chunks.clone(),
            thinking_chunks: state.thinking_chunks.clone(),
            metadata: CheckpointMetadata {
                model: Some(self.context.model.clone()),
                provider: Some(self.context.provider),
                title: self.context.title.clone(),
                total_chunks: state.chunks.len(),
                completed,
                system_prompt: self.context.system_prompt.clone(),
                temperature: self.context.temperature,
                top_p: self.context.top_p,
            },
        }
    }

    /// Runs the delta stream to its terminal signal.
    ///
    /// # Errors
    /// Returns the first upstream error, or [`AdapterError::StreamEnded`] when
    /// the stream closes without a terminal signal.
    pub async fn drive(&self, state: &mut StreamState, mut deltas: DeltaStream) -> AdapterResult<()> {
        let provider = self.context.provider.as_str();
        let interval = self.checkpoint_interval.max(1);

        while let Some(delta) = deltas.next().await {
            match delta? {
                StreamDelta::Thinking(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    state.on_thinking(text.clone());
                    self.deliver(&OutboundEvent::AiChatChunk(ChatChunk {
                        context: self.context.clone(),
                        chunk: None,
                        thinking_text: Some(text),
                        is_thinking: Some(true),
                        thinking_duration: None,
                        done: false,
                    }))
                    .await;
                }
                StreamDelta::Content(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let was_thinking = state.is_thinking;
                    state.on_content(text.clone());
                    if was_thinking {
                        if let Some(duration) = state.thinking_duration {
                            #[allow(clippy::cast_precision_loss)]
                            histogram!("slipstream_thinking_duration_ms", "provider" => provider)
                                .record(duration as f64);
                        }
                    }
                    counter!("slipstream_stream_chunks_total", "provider" => provider).increment(1);

                    self.deliver(&OutboundEvent::AiChatChunk(ChatChunk {
                        context: self.context.clone(),
                        chunk: Some(text),
                        thinking_text: None,
                        is_thinking: Some(false),
                        thinking_duration: state.thinking_duration,
                        done: false,
                    }))
                    .await;

                    if state.chunks.len() % interval == 0 {
                        self.checkpoints.save(self.checkpoint(state, false));
                    }
                }
                StreamDelta::InlineData { data, mime_type } => {
                    if data.is_empty() {
                        continue;
                    }
                    self.deliver(&OutboundEvent::AiChatInlineData(ChatInlineData {
                        context: self.context.clone(),
                        data,
                        mime_type,
                        done: false,
                    }))
                    .await;
                }
                StreamDelta::Finish { usage } => {
                    self.finish(state, usage).await;
                    return Ok(());
                }
            }
        }

        Err(AdapterError::StreamEnded)
    }

    async fn finish(&self, state: &StreamState, usage: Option<u64>) {
        let text = state.chunks.concat();
        let thinking_text = state.thinking_text();
        let context = &self.context;

        let message = FinalMessage {
            conversation_id: context.conversation_id.clone(),
            user_id: context.user_id.clone(),
            provider: context.provider,
            model: context.model.clone(),
            text: text.clone(),
            thinking_text: thinking_text.clone(),
            thinking_duration_ms: state.thinking_duration,
            total_tokens: usage,
            title: context.title.clone(),
        };
        if let Err(err) = self.conversations.record_assistant_turn(&message).await {
            error!(conversation_id = %context.conversation_id, error = %err, "failed to persist assistant message");
        }

        self.deliver(&OutboundEvent::AiChatResponse(ChatResponse {
            context: context.clone(),
            chunk: text,
            thinking_text,
            thinking_duration: state.thinking_duration,
            usage,
            done: true,
        }))
        .await;

        self.checkpoints.delete();
        counter!("slipstream_stream_completed_total", "provider" => context.provider.as_str())
            .increment(1);
        info!(
            conversation_id = %context.conversation_id,
            provider = %context.provider,
            model = %context.model,
            chunks = state.chunks.len(),
            "stream completed"
        );
    }

    /// Reports a failed stream and keeps its progress resumable.
    pub async fn fail(&self, state: &StreamState, err: &(dyn std::error::Error + Send + Sync + 'static)) {
        let context = &self.context;
        counter!("slipstream_stream_errors_total", "provider" => context.provider.as_str())
            .increment(1);
        warn!(
            conversation_id = %context.conversation_id,
            provider = %context.provider,
            chunks = state.chunks.len(),
            error = %err,
            "stream failed"
        );

        self.deliver(&OutboundEvent::AiChatError(ChatError {
            context: context.clone(),
            message: safe_error_message(err),
            done: true,
        }))
        .await;

        // A resumed stream that failed before producing anything keeps the
        // replayed checkpoint instead of replacing it with an empty one.
        if self.resumed && state.chunks.is_empty() && state.thinking_chunks.is_empty() {
            debug!(conversation_id = %context.conversation_id, "keeping replayed checkpoint");
            return;
        }
        self.checkpoints.save(self.checkpoint(state, false));
        debug!(conversation_id = %context.conversation_id, "saved checkpoint for resume");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        checkpoint_store::{CheckpointStore, InMemoryCheckpointStore},
        checkpoint_writer::CheckpointWriter,
        fanout::FanoutHub,
        persistence::InMemoryConversationStore,
    };
    use futures::stream;
    use serde_json::Value;
    use shared::models::Provider;
    use tokio::sync::mpsc;

    struct Harness {
        sink: StreamSink,
        store: Arc<InMemoryCheckpointStore>,
        rx: mpsc::Receiver<Arc<str>>,
    }

    fn harness(interval: usize) -> Harness {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = CheckpointWriter::new(store.clone(), 4);
        let (connection, rx) = Connection::channel("u1", 1024);
        let sink = StreamSink {
            context: StreamContext {
                conversation_id: "c1".into(),
                user_id: "u1".into(),
                provider: Provider::OpenAi,
                model: "gpt-4o-mini".into(),
                title: Some("Test".into()),
                ..StreamContext::default()
            },
            channel: Channel::Conversation("c1".into()),
            connection,
            fanout: Arc::new(FanoutHub::new(64)),
            checkpoints: writer.session("c1"),
            conversations: Arc::new(InMemoryConversationStore::new()),
            checkpoint_interval: interval,
            resumed: false,
        };
        Harness { sink, store, rx }
    }

    fn scripted(deltas: Vec<AdapterResult<StreamDelta>>) -> DeltaStream {
        stream::iter(deltas).boxed()
    }

    fn content(n: usize) -> Vec<AdapterResult<StreamDelta>> {
        (0..n).map(|i| Ok(StreamDelta::Content(format!("c{i} ")))).collect()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn success_delivers_chunks_then_one_response_and_clears_checkpoint() {
        let mut h = harness(10);
        let mut deltas = content(12);
        deltas.push(Ok(StreamDelta::Finish { usage: Some(30) }));

        let mut state = StreamState::new();
        h.sink.drive(&mut state, scripted(deltas)).await.unwrap();
        h.sink.checkpoints.flush().await;

        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 13);
        assert!(events[..12].iter().all(|e| e["type"] == "ai_chat_chunk" && e["done"] == false));
        assert_eq!(events[12]["type"], "ai_chat_response");
        assert_eq!(events[12]["done"], true);
        assert_eq!(events[12]["usage"], 30);
        assert!(events[12]["chunk"].as_str().unwrap().starts_with("c0 c1 "));
        assert!(h.store.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_keeps_partial_progress() {
        let mut h = harness(10);
        let mut deltas = content(7);
        deltas.push(Err(AdapterError::Decode("boom".into())));

        let mut state = StreamState::new();
        let err = h.sink.drive(&mut state, scripted(deltas)).await.unwrap_err();
        h.sink.fail(&state, &err).await;
        h.sink.checkpoints.flush().await;

        let checkpoint = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(checkpoint.chunks.len(), 7);
        assert!(!checkpoint.metadata.completed);

        let events = drain(&mut h.rx);
        let last = events.last().unwrap();
        assert_eq!(last["type"], "ai_chat_error");
        assert_eq!(last["message"], "failed to decode upstream event: boom");
        assert_eq!(last["done"], true);
    }

    #[tokio::test]
    async fn stream_without_terminal_signal_is_an_error() {
        let h = harness(10);
        let mut state = StreamState::new();
        let err = h.sink.drive(&mut state, scripted(content(3))).await.unwrap_err();
        assert!(matches!(err, AdapterError::StreamEnded));
        assert_eq!(state.chunks().len(), 3);
    }

    #[tokio::test]
    async fn empty_deltas_are_skipped() {
        let mut h = harness(10);
        let deltas = vec![
            Ok(StreamDelta::Thinking(String::new())),
            Ok(StreamDelta::Content(String::new())),
            Ok(StreamDelta::Content("x".into())),
            Ok(StreamDelta::Finish { usage: None }),
        ];

        let mut state = StreamState::new();
        h.sink.drive(&mut state, scripted(deltas)).await.unwrap();

        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 2);
        assert!(events[1].get("thinkingText").is_none());
        assert!(events[1].get("thinkingDuration").is_none());
    }

    #[tokio::test]
    async fn thinking_duration_is_set_once_on_first_transition() {
        let mut h = harness(10);
        let deltas = vec![
            Ok(StreamDelta::Thinking("a".into())),
            Ok(StreamDelta::Content("b".into())),
            Ok(StreamDelta::Thinking("c".into())),
            Ok(StreamDelta::Content("d".into())),
            Ok(StreamDelta::Finish { usage: None }),
        ];

        let mut state = StreamState::new();
        h.sink.drive(&mut state, scripted(deltas)).await.unwrap();
        let duration = state.thinking_duration();
        assert!(duration.is_some());

        let events = drain(&mut h.rx);
        assert_eq!(events[0]["isThinking"], true);
        assert!(events[0].get("thinkingDuration").is_none());
        let reported: Vec<_> = events
            .iter()
            .filter_map(|e| e.get("thinkingDuration").and_then(Value::as_u64))
            .collect();
        assert!(reported.iter().all(|d| Some(*d) == duration));
        assert_eq!(events.last().unwrap()["thinkingText"], "ac");
    }

    #[test]
    fn thinking_after_content_reopens_the_thinking_phase() {
        let mut state = StreamState::new();
        state.on_thinking("a".into());
        assert!(state.is_thinking());

        state.on_content("b".into());
        assert!(!state.is_thinking());
        let duration = state.thinking_duration();
        assert!(duration.is_some());

        state.on_thinking("c".into());
        assert!(state.is_thinking());
        state.on_content("d".into());
        assert!(!state.is_thinking());
        assert_eq!(state.thinking_duration(), duration);
    }

    #[tokio::test]
    async fn stream_closed_while_thinking_has_no_duration() {
        let h = harness(10);
        let deltas = vec![
            Ok(StreamDelta::Thinking("still going".into())),
            Ok(StreamDelta::Finish { usage: None }),
        ];

        let mut state = StreamState::new();
        h.sink.drive(&mut state, scripted(deltas)).await.unwrap();
        assert_eq!(state.thinking_duration(), None);
    }

    #[tokio::test]
    async fn fanout_subscribers_see_the_same_frames() {
        let mut h = harness(10);
        let mut subscription = h.sink.fanout.subscribe(&h.sink.channel);
        let deltas = vec![
            Ok(StreamDelta::Content("hi".into())),
            Ok(StreamDelta::InlineData {
                data: "AAAA".into(),
                mime_type: Some("image/png".into()),
            }),
            Ok(StreamDelta::Finish { usage: None }),
        ];

        let mut state = StreamState::new();
        h.sink.drive(&mut state, scripted(deltas)).await.unwrap();

        let direct = drain(&mut h.rx);
        for expected in &direct {
            let published = subscription.next().await.unwrap();
            let published: Value = serde_json::from_str(&published).unwrap();
            assert_eq!(&published, expected);
        }
        assert_eq!(direct[1]["type"], "ai_chat_inline_data");
        assert_eq!(direct[1]["mimeType"], "image/png");
    }
}
