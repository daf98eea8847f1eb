//! `ai_chat_request` handling.

use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use shared::models::{
    Channel, ChatChunk, ChatError, ChatRequest, ConversationCreated, OutboundEvent,
    PersistedCheckpoint, StreamContext, StreamResumed, resolve_channel,
};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    Resolver,
    connection::Connection,
    errors::{ResolverError, ResolverResult, safe_error_message},
    stream::{StreamSink, StreamState},
};
use crate::{
    providers::{AdapterError, AdapterRequest, AdapterResult, DeltaStream},
    services::lease::StreamLease,
};

/// Everything the detached stream task needs.
struct PreparedStream {
    sink: StreamSink,
    request: AdapterRequest,
    api_key: AdapterResult<String>,
    lease: StreamLease,
}

impl Resolver {
    pub(super) async fn handle_chat(
        &self,
        request: ChatRequest,
        connection: &Connection,
    ) -> Option<JoinHandle<()>> {
        counter!("slipstream_chat_requests_total", "provider" => request.provider.as_str())
            .increment(1);

        match self.prepare_chat(&request, connection).await {
            Ok(prepared) => Some(self.spawn_stream(prepared)),
            Err(err) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    error = %err,
                    "chat request rejected before streaming"
                );
                let context = StreamContext {
                    conversation_id: request.conversation_id.clone(),
                    user_id: connection.user_id().to_string(),
                    provider: request.provider,
                    model: request.resolved_model(),
                    ..StreamContext::default()
                };
                let event = OutboundEvent::AiChatError(ChatError {
                    context,
                    message: safe_error_message(&err),
                    done: true,
                });
                connection.send(&event).await;
                // The lease holder owns the channel; a refused duplicate stays private.
                if !matches!(err, ResolverError::LeaseHeld(_)) {
                    let channel = resolve_channel(&request.conversation_id, connection.user_id());
                    self.fanout.publish(&channel, &event).await;
                }
                None
            }
        }
    }

    async fn prepare_chat(
        &self,
        request: &ChatRequest,
        connection: &Connection,
    ) -> ResolverResult<PreparedStream> {
        let user_id = connection.user_id();
        let is_new_chat = request.is_new_chat();
        let model = request.resolved_model();

        let early_lease = if is_new_chat {
            None
        } else {
            Some(self.leases.try_acquire(user_id, &request.conversation_id)?)
        };

        let history = if is_new_chat {
            Vec::new()
        } else {
            self.conversations.history(&request.conversation_id).await?
        };

        let record = self.conversations.record_user_turn(user_id, request).await?;
        let lease = match early_lease {
            Some(lease) => lease,
            None => self.leases.try_acquire(user_id, &record.id)?,
        };

        let checkpoint = if record.created {
            None
        } else {
            self.load_checkpoint(&record.id).await
        };

        let title = match record.title.clone() {
            Some(title) => title,
            None => self.generate_title(&record.id, request).await,
        };

        let api_key = self.resolve_api_key(user_id, request).await;

        let context = StreamContext {
            conversation_id: record.id.clone(),
            user_id: user_id.to_string(),
            provider: request.provider,
            model: model.clone(),
            title: Some(title.clone()),
            system_prompt: request.system_prompt.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
        };
        let channel = resolve_channel(&request.conversation_id, user_id);

        let resumed = match checkpoint {
            Some(checkpoint) if checkpoint.is_resumable() => {
                self.replay(&checkpoint, &context, &channel, connection).await;
                true
            }
            _ => false,
        };

        if record.created {
            let created = OutboundEvent::ConversationCreated(ConversationCreated {
                conversation_id: record.id.clone(),
                user_id: user_id.to_string(),
                title,
                timestamp: record.created_at.timestamp_millis(),
            });
            self.fanout
                .publish(&Channel::User(user_id.to_string()), &created)
                .await;
            info!(conversation_id = %record.id, "conversation created");
        }

        let sink = StreamSink {
            checkpoints: self.checkpoints.session(&record.id),
            context,
            channel,
            connection: connection.clone(),
            fanout: self.fanout(),
            conversations: self.conversations.clone(),
            checkpoint_interval: self.settings.checkpoint_interval,
            resumed,
        };

        let adapter_request = AdapterRequest {
            provider: request.provider,
            model,
            user_id: user_id.to_string(),
            api_key: String::new(),
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            history,
            is_new_chat,
        };

        Ok(PreparedStream {
            sink,
            request: adapter_request,
            api_key,
            lease,
        })
    }

    /// Reads the stored checkpoint. Storage errors are logged and treated as
    /// no checkpoint.
    async fn load_checkpoint(&self, conversation_id: &str) -> Option<PersistedCheckpoint> {
        match self.checkpoints.store().get(conversation_id).await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(conversation_id, error = %err, "checkpoint lookup failed");
                None
            }
        }
    }

    async fn generate_title(&self, conversation_id: &str, request: &ChatRequest) -> String {
        let title = match self.titles.generate(&request.prompt).await {
            Ok(title) => title,
            Err(err) => {
                debug!(conversation_id, error = %err, "title generation failed");
                return request.provider.display_name().to_string();
            }
        };

        if let Err(err) = self.conversations.set_title(conversation_id, &title).await {
            warn!(conversation_id, error = %err, "failed to store conversation title");
        }
        title
    }

    /// The user's own key when the client says one is configured, otherwise
    /// the server key for the provider.
    async fn resolve_api_key(&self, user_id: &str, request: &ChatRequest) -> AdapterResult<String> {
        let provider = request.provider;
        let stored = if request.has_provider_configured {
            match self.conversations.api_key(user_id, provider).await {
                Ok(key) => key,
                Err(err) => {
                    warn!(provider = provider.as_str(), error = %err, "user key lookup failed");
                    None
                }
            }
        } else {
            None
        };

        stored
            .or_else(|| self.settings.providers.get(provider).api_key.clone())
            .filter(|key| !key.trim().is_empty())
            .ok_or(AdapterError::MissingApiKey(provider))
    }

    async fn replay(
        &self,
        checkpoint: &PersistedCheckpoint,
        context: &StreamContext,
        channel: &Channel,
        connection: &Connection,
    ) {
        counter!("slipstream_stream_resumes_total").increment(1);
        info!(
            conversation_id = %context.conversation_id,
            chunks = checkpoint.chunks.len(),
            "replaying unfinished checkpoint"
        );

        let resumed = OutboundEvent::StreamResumed(StreamResumed {
            conversation_id: context.conversation_id.clone(),
            resumed_at: checkpoint.chunks.len(),
            chunks: checkpoint.chunks.clone(),
            title: checkpoint.metadata.title.clone(),
            model: checkpoint.metadata.model.clone(),
            provider: checkpoint.metadata.provider,
        });
        self.fanout.publish(channel, &resumed).await;

        connection
            .send(&OutboundEvent::AiChatChunk(ChatChunk {
                context: context.clone(),
                chunk: Some(checkpoint.replay_text()),
                thinking_text: None,
                is_thinking: None,
                thinking_duration: None,
                done: false,
            }))
            .await;
    }

    fn spawn_stream(&self, prepared: PreparedStream) -> JoinHandle<()> {
        let PreparedStream {
            sink,
            mut request,
            api_key,
            lease,
        } = prepared;
        let adapters = self.adapters.clone();
        let upstream_timeout = self.settings.upstream_timeout;
        let span = info_span!(
            "stream",
            conversation_id = %sink.context.conversation_id,
            provider = sink.context.provider.as_str(),
            model = %sink.context.model,
        );

        tokio::spawn(
            async move {
                let mut state = StreamState::new();
                let outcome = async {
                    let adapter = adapters.get(request.provider)?;
                    request.api_key = api_key?;
                    let deltas = timeout(upstream_timeout, adapter.open(&request))
                        .await
                        .map_err(|_| timed_out(upstream_timeout))??;
                    sink.drive(&mut state, with_idle_timeout(deltas, upstream_timeout))
                        .await
                }
                .await;

                match outcome {
                    Ok(()) => lease.mark_completed(),
                    Err(err) => {
                        lease.mark_failed();
                        sink.fail(&state, &err).await;
                    }
                }

                sink.checkpoints.flush().await;
                drop(lease);
            }
            .instrument(span),
        )
    }
}

fn timed_out(window: Duration) -> AdapterError {
    counter!("slipstream_stream_timeouts_total").increment(1);
    AdapterError::Timeout(window)
}

/// Fails the stream once the upstream goes quiet for longer than `idle`.
///
/// The window restarts on every delta, so a long answer that keeps producing
/// output is never cut off.
fn with_idle_timeout(deltas: DeltaStream, idle: Duration) -> DeltaStream {
    tokio_stream::StreamExt::timeout(deltas, idle)
        .map(move |item| item.unwrap_or_else(|_| Err(timed_out(idle))))
        .boxed()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use serde_json::Value;
    use shared::models::{CheckpointMetadata, Provider};
    use tokio::sync::mpsc;

    use crate::{
        providers::{AdapterRegistry, DeltaStream, StreamAdapter, StreamDelta},
        resolver::{Connection, testing::wiring},
        services::{
            checkpoint_store::CheckpointStore as _, fanout::FanoutChannel as _,
            persistence::ConversationStore as _,
        },
    };

    use super::*;

    struct Scripted(Vec<&'static str>);

    #[async_trait]
    impl StreamAdapter for Scripted {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn open(&self, request: &AdapterRequest) -> AdapterResult<DeltaStream> {
            assert_eq!(request.api_key, "sk-server");
            let mut deltas: Vec<AdapterResult<StreamDelta>> = self
                .0
                .iter()
                .map(|text| Ok(StreamDelta::Content((*text).to_string())))
                .collect();
            deltas.push(Ok(StreamDelta::Finish { usage: None }));
            Ok(stream::iter(deltas).boxed())
        }
    }

    fn registry(chunks: Vec<&'static str>) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Scripted(chunks)));
        registry
    }

    fn request(conversation_id: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "conversationId": conversation_id,
            "prompt": "hello",
            "provider": "openai",
        }))
        .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    fn with_server_key(w: &mut crate::resolver::testing::Wiring) {
        let resolver = Arc::get_mut(&mut w.resolver).unwrap();
        resolver.settings.providers.openai.api_key = Some("sk-server".into());
    }

    #[tokio::test]
    async fn new_chat_announces_conversation_and_streams() {
        let mut w = wiring(registry(vec!["Hi", " there"]));
        with_server_key(&mut w);
        let mut user_channel = w.fanout.subscribe(&Channel::User("u1".into()));
        let (connection, mut rx) = Connection::channel("u1", 64);

        let task = w
            .resolver
            .handle_chat(request("new-chat"), &connection)
            .await
            .unwrap();
        task.await.unwrap();

        let created: Value = serde_json::from_str(&user_channel.next().await.unwrap()).unwrap();
        assert_eq!(created["type"], "conversation:created");
        assert_eq!(created["title"], "Generated Title");
        let conversation_id = created["conversationId"].as_str().unwrap().to_string();
        assert_ne!(conversation_id, "new-chat");

        let events = drain(&mut rx);
        let types: Vec<_> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["ai_chat_chunk", "ai_chat_chunk", "ai_chat_response"]);
        assert_eq!(events[2]["chunk"], "Hi there");
        assert_eq!(events[2]["conversationId"], conversation_id);

        // The sentinel stream is published on the user channel.
        let first_chunk: Value = serde_json::from_str(&user_channel.next().await.unwrap()).unwrap();
        assert_eq!(first_chunk["type"], "ai_chat_chunk");
        assert_eq!(
            w.conversations.owner(&conversation_id).await.as_deref(),
            Some("u1")
        );
    }

    #[tokio::test]
    async fn missing_key_fails_inside_the_stream_and_checkpoints() {
        let w = wiring(registry(vec!["never"]));
        let (connection, mut rx) = Connection::channel("u1", 64);

        let task = w
            .resolver
            .handle_chat(request("new-chat"), &connection)
            .await
            .unwrap();
        task.await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "ai_chat_error");
        assert_eq!(events[0]["message"], "no API key configured for OpenAI");
        assert_eq!(events[0]["done"], true);

        let conversation_id = events[0]["conversationId"].as_str().unwrap();
        let saved = w.checkpoints.get(conversation_id).await.unwrap().unwrap();
        assert!(!saved.metadata.completed);
        assert!(saved.chunks.is_empty());
    }

    #[tokio::test]
    async fn concurrent_request_for_a_streaming_conversation_is_refused() {
        let w = wiring(registry(vec!["x"]));
        let (connection, mut rx) = Connection::channel("u1", 64);
        let _held = w.resolver.leases.try_acquire("u1", "conv-1").unwrap();
        let mut feed = w.fanout.subscribe(&Channel::Conversation("conv-1".into()));

        let task = w.resolver.handle_chat(request("conv-1"), &connection).await;
        assert!(task.is_none());
        assert!(timeout(Duration::from_millis(50), feed.next()).await.is_err());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "ai_chat_error");
        assert_eq!(
            events[0]["message"],
            "A response is already streaming for this conversation"
        );
        assert!(w.checkpoints.get("conv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfinished_checkpoint_is_replayed_before_the_new_stream() {
        let mut w = wiring(registry(vec!["more"]));
        with_server_key(&mut w);
        let (connection, mut rx) = Connection::channel("u1", 64);

        // Seed an existing conversation and an interrupted stream for it.
        let first = w
            .conversations
            .record_user_turn("u1", &request("new-chat"))
            .await
            .unwrap();
        w.checkpoints
            .save(
                &first.id,
                &PersistedCheckpoint {
                    chunks: vec!["Hel".into(), "lo".into()],
                    thinking_chunks: Vec::new(),
                    metadata: CheckpointMetadata {
                        total_chunks: 2,
                        completed: false,
                        ..CheckpointMetadata::default()
                    },
                },
            )
            .await
            .unwrap();
        let mut stream_channel = w.fanout.subscribe(&Channel::Conversation(first.id.clone()));

        let task = w
            .resolver
            .handle_chat(request(&first.id), &connection)
            .await
            .unwrap();
        task.await.unwrap();

        let resumed: Value = serde_json::from_str(&stream_channel.next().await.unwrap()).unwrap();
        assert_eq!(resumed["type"], "stream:resumed");
        assert_eq!(resumed["resumedAt"], 2);

        let events = drain(&mut rx);
        assert_eq!(events[0]["type"], "ai_chat_chunk");
        assert_eq!(events[0]["chunk"], "Hello");
        assert_eq!(events[0]["done"], false);
        assert_eq!(events.last().unwrap()["type"], "ai_chat_response");
        assert!(w.checkpoints.get(&first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_upstream_times_out() {
        struct Stalled;

        #[async_trait]
        impl StreamAdapter for Stalled {
            fn provider(&self) -> Provider {
                Provider::OpenAi
            }

            async fn open(&self, _request: &AdapterRequest) -> AdapterResult<DeltaStream> {
                Ok(stream::pending().boxed())
            }
        }

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Stalled));
        let mut w = wiring(registry);
        with_server_key(&mut w);
        Arc::get_mut(&mut w.resolver).unwrap().settings.upstream_timeout =
            Duration::from_millis(50);
        let (connection, mut rx) = Connection::channel("u1", 64);

        let task = w
            .resolver
            .handle_chat(request("new-chat"), &connection)
            .await
            .unwrap();
        task.await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "ai_chat_error");
        assert!(events[0]["message"].as_str().unwrap().starts_with("upstream sent nothing for"));
    }
}
