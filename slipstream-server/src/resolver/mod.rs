//! Inbound event dispatch.
//!
//! Every transport hands raw frames to [`Resolver::dispatch`]. Frames are
//! normalized to text, parsed against the known tag set and routed through an
//! exhaustive match on [`InboundEvent`].

pub mod assets;
pub mod chat;
pub mod connection;
pub mod errors;
pub mod stream;

use std::{sync::Arc, time::Duration};

use metrics::counter;
use shared::{
    config::server::{Config, ProvidersSection, StorageSection},
    models::{
        Channel, EventTag, FrameError, InboundEvent, InvalidMessageReply, OutboundEvent,
        ParsedFrame, TypingIndicator, UnhandledEventNotice, epoch_millis, parse_frame,
    },
};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    providers::AdapterRegistry,
    services::{
        checkpoint_writer::CheckpointWriter, fanout::FanoutChannel, lease::LeaseRegistry,
        persistence::ConversationStore, storage::AttachmentStorage, title::TitleGenerator,
    },
};

pub use connection::Connection;

/// A transport frame before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
    /// A message delivered as several buffers, e.g. a fragmented frame.
    Fragments(Vec<Vec<u8>>),
}

impl RawFrame {
    /// Collapses the frame into one UTF-8 string.
    ///
    /// # Errors
    /// Returns [`FrameError::Encoding`] for bytes that are not UTF-8.
    pub fn into_text(self) -> Result<String, FrameError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(bytes) => String::from_utf8(bytes).map_err(|_| FrameError::Encoding),
            Self::Fragments(parts) => {
                String::from_utf8(parts.concat()).map_err(|_| FrameError::Encoding)
            }
        }
    }
}

impl From<String> for RawFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Tunables the handlers read on every request.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub checkpoint_interval: usize,
    pub upstream_timeout: Duration,
    pub global_channel: String,
    pub providers: ProvidersSection,
    pub storage: StorageSection,
}

impl ResolverSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            checkpoint_interval: config.streaming.checkpoint_interval,
            upstream_timeout: Duration::from_secs(config.streaming.upstream_timeout_secs),
            global_channel: config.streaming.global_channel.clone(),
            providers: config.providers.clone(),
            storage: config.storage.clone(),
        }
    }

    #[must_use]
    pub fn global(&self) -> Channel {
        Channel::Global(self.global_channel.clone())
    }
}

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct Resolver {
    pub(crate) adapters: Arc<AdapterRegistry>,
    pub(crate) conversations: Arc<dyn ConversationStore>,
    pub(crate) checkpoints: CheckpointWriter,
    pub(crate) fanout: Arc<dyn FanoutChannel>,
    pub(crate) leases: Arc<LeaseRegistry>,
    pub(crate) titles: Arc<dyn TitleGenerator>,
    pub(crate) storage: Arc<dyn AttachmentStorage>,
    pub(crate) http: reqwest::Client,
    pub(crate) settings: ResolverSettings,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("adapters", &self.adapters)
            .field("checkpoints", &self.checkpoints)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Builder-style constructor arguments for [`Resolver`].
pub struct ResolverParts {
    pub adapters: AdapterRegistry,
    pub conversations: Arc<dyn ConversationStore>,
    pub checkpoints: CheckpointWriter,
    pub fanout: Arc<dyn FanoutChannel>,
    pub leases: Arc<LeaseRegistry>,
    pub titles: Arc<dyn TitleGenerator>,
    pub storage: Arc<dyn AttachmentStorage>,
    pub http: reqwest::Client,
    pub settings: ResolverSettings,
}

impl Resolver {
    #[must_use]
    pub fn new(parts: ResolverParts) -> Arc<Self> {
        Arc::new(Self {
            adapters: Arc::new(parts.adapters),
            conversations: parts.conversations,
            checkpoints: parts.checkpoints,
            fanout: parts.fanout,
            leases: parts.leases,
            titles: parts.titles,
            storage: parts.storage,
            http: parts.http,
            settings: parts.settings,
        })
    }

    #[must_use]
    pub fn fanout(&self) -> Arc<dyn FanoutChannel> {
        Arc::clone(&self.fanout)
    }

    #[must_use]
    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Handles a frame on a background task and returns immediately.
    pub fn dispatch(self: &Arc<Self>, frame: RawFrame, connection: &Connection) {
        let resolver = Arc::clone(self);
        let connection = connection.clone();
        tokio::spawn(async move {
            resolver.handle(frame, &connection).await;
        });
    }

    /// Handles a frame to the point where any upstream stream is running.
    ///
    /// Returns the detached stream task, if the frame started one.
    pub async fn handle(&self, frame: RawFrame, connection: &Connection) -> Option<JoinHandle<()>> {
        let parsed = frame.into_text().and_then(|text| parse_frame(&text));

        match parsed {
            Ok(ParsedFrame::Event(event)) => self.route(*event, connection).await,
            Ok(ParsedFrame::Unhandled(tag)) => {
                self.unhandled(tag, connection.user_id()).await;
                None
            }
            Err(err) => {
                counter!("slipstream_invalid_messages_total").increment(1);
                warn!(user_id = %connection.user_id(), error = %err, "rejecting inbound frame");
                connection.send(&InvalidMessageReply::default()).await;
                None
            }
        }
    }

    async fn route(&self, event: InboundEvent, connection: &Connection) -> Option<JoinHandle<()>> {
        let user_id = connection.user_id().to_string();
        let span = info_span!("event", event = event.tag().as_str(), user_id = %user_id);

        async move {
            match event {
                InboundEvent::AiChatRequest(request) => {
                    return self.handle_chat(request, connection).await;
                }
                InboundEvent::Typing(typing) => self.handle_typing(typing, &user_id).await,
                InboundEvent::Ping => {
                    connection
                        .send(&OutboundEvent::Pong {
                            user_id: user_id.clone(),
                        })
                        .await;
                }
                InboundEvent::AssetPaste(paste) => self.handle_asset_paste(paste, connection).await,
                InboundEvent::AssetAttached(attached) => {
                    self.handle_asset_attached(attached, connection).await;
                }
                InboundEvent::AssetFetchRequest(fetch) => {
                    self.handle_asset_fetch(fetch, connection).await;
                }
                InboundEvent::AssetUploadComplete(complete) => {
                    self.handle_asset_upload_complete(complete, connection).await;
                }
                InboundEvent::AssetUploadProgress(progress) => {
                    self.handle_asset_upload_progress(progress, &user_id).await;
                }
            }
            None
        }
        .instrument(span)
        .await
    }

    async fn handle_typing(&self, typing: TypingIndicator, user_id: &str) {
        let event = OutboundEvent::Typing(TypingIndicator {
            conversation_id: typing.conversation_id,
            user_id: user_id.to_string(),
        });
        self.fanout.publish(&self.settings.global(), &event).await;
    }

    async fn unhandled(&self, tag: EventTag, user_id: &str) {
        counter!("slipstream_unhandled_events_total", "type" => tag.as_str()).increment(1);
        debug!(event = tag.as_str(), user_id, "no handler for event");
        let notice = UnhandledEventNotice {
            event: "never".to_string(),
            tag: tag.as_str().to_string(),
            user_id: user_id.to_string(),
            timestamp: epoch_millis(),
        };
        self.fanout.publish(&self.settings.global(), &notice).await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolver::testing::wiring, services::fanout::FanoutChannel as _};
    use futures::StreamExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_json(rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn binary_and_fragmented_frames_normalize_to_text() {
        assert_eq!(RawFrame::Binary(b"{}".to_vec()).into_text().unwrap(), "{}");
        assert_eq!(
            RawFrame::Fragments(vec![b"{\"type\":".to_vec(), b"\"ping\"}".to_vec()])
                .into_text()
                .unwrap(),
            r#"{"type":"ping"}"#
        );
        assert_eq!(
            RawFrame::Binary(vec![0xff, 0xfe]).into_text(),
            Err(FrameError::Encoding)
        );
    }

    #[tokio::test]
    async fn malformed_frames_get_the_generic_reply() {
        let w = wiring(AdapterRegistry::new());
        let (connection, mut rx) = Connection::channel("u1", 8);

        for frame in ["not json", r#"{"no":"type"}"#, r#"{"type":"teleport"}"#] {
            assert!(w.resolver.handle(frame.into(), &connection).await.is_none());
            assert_eq!(next_json(&mut rx).await, serde_json::json!({ "error": "Invalid message" }));
        }
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let w = wiring(AdapterRegistry::new());
        let (connection, mut rx) = Connection::channel("u1", 8);

        w.resolver.handle(r#"{"type":"ping"}"#.into(), &connection).await;
        assert_eq!(
            next_json(&mut rx).await,
            serde_json::json!({ "type": "pong", "userId": "u1" })
        );
    }

    #[tokio::test]
    async fn typing_and_unhandled_tags_go_to_the_global_channel() {
        let w = wiring(AdapterRegistry::new());
        let mut global = w.fanout.subscribe(&w.resolver.settings().global());
        let (connection, _rx) = Connection::channel("u9", 8);

        w.resolver
            .handle(
                r#"{"type":"typing","conversationId":"c1","userId":"spoofed"}"#.into(),
                &connection,
            )
            .await;
        w.resolver
            .handle(r#"{"type":"image_gen_request","prompt":"cat"}"#.into(), &connection)
            .await;

        let typing: Value = serde_json::from_str(&global.next().await.unwrap()).unwrap();
        assert_eq!(typing["type"], "typing");
        assert_eq!(typing["userId"], "u9");

        let notice: Value = serde_json::from_str(&global.next().await.unwrap()).unwrap();
        assert_eq!(notice["event"], "never");
        assert_eq!(notice["type"], "image_gen_request");
        assert_eq!(notice["userId"], "u9");
    }
}
