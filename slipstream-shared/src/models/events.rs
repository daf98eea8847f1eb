//! # Wire events
//!
//! Every frame on the chat socket and every fanout message is a JSON object
//! carrying a `type` tag. Inbound frames decode into [`InboundEvent`]; the
//! server only ever emits [`OutboundEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    attachment::{
        AssetAttached, AssetFetchError, AssetFetchRequest, AssetFetchResponse, AssetPaste,
        AssetReady, AssetUploadComplete, AssetUploadError, AssetUploadInstructions,
        AssetUploadProgress,
    },
    chat::{ChatRequest, Provider},
};

/// Every event tag the protocol knows about.
///
/// Only some tags have an inbound handler; the rest are accepted from clients
/// and routed to the unhandled branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    AiChatRequest,
    Typing,
    Ping,
    AssetPaste,
    AssetAttached,
    AssetFetchRequest,
    AssetUploadComplete,
    AssetUploadProgress,
    AiChatChunk,
    AiChatResponse,
    AiChatError,
    AiChatInlineData,
    ConversationCreated,
    StreamResumed,
    AssetUploadInstructions,
    AssetReady,
    AssetUploadError,
    AssetFetchResponse,
    AssetFetchError,
    Pong,
    AssetUploadRequest,
    AssetUploadResponse,
    ImageGenRequest,
    ImageGenResponse,
}

impl EventTag {
    const TABLE: [(Self, &'static str); 24] = [
        (Self::AiChatRequest, "ai_chat_request"),
        (Self::Typing, "typing"),
        (Self::Ping, "ping"),
        (Self::AssetPaste, "asset_paste"),
        (Self::AssetAttached, "asset_attached"),
        (Self::AssetFetchRequest, "asset_fetch_request"),
        (Self::AssetUploadComplete, "asset_upload_complete"),
        (Self::AssetUploadProgress, "asset_upload_progress"),
        (Self::AiChatChunk, "ai_chat_chunk"),
        (Self::AiChatResponse, "ai_chat_response"),
        (Self::AiChatError, "ai_chat_error"),
        (Self::AiChatInlineData, "ai_chat_inline_data"),
        (Self::ConversationCreated, "conversation:created"),
        (Self::StreamResumed, "stream:resumed"),
        (Self::AssetUploadInstructions, "asset_upload_instructions"),
        (Self::AssetReady, "asset_ready"),
        (Self::AssetUploadError, "asset_upload_error"),
        (Self::AssetFetchResponse, "asset_fetch_response"),
        (Self::AssetFetchError, "asset_fetch_error"),
        (Self::Pong, "pong"),
        (Self::AssetUploadRequest, "asset_upload_request"),
        (Self::AssetUploadResponse, "asset_upload_response"),
        (Self::ImageGenRequest, "image_gen_request"),
        (Self::ImageGenResponse, "image_gen_response"),
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(tag, _)| *tag == self)
            .map_or("unknown", |(_, name)| name)
    }

    /// Tags with a dispatch handler.
    #[must_use]
    pub const fn is_routable(self) -> bool {
        matches!(
            self,
            Self::AiChatRequest
                | Self::Typing
                | Self::Ping
                | Self::AssetPaste
                | Self::AssetAttached
                | Self::AssetFetchRequest
                | Self::AssetUploadComplete
                | Self::AssetUploadProgress
        )
    }
}

impl TryFrom<&str> for EventTag {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::TABLE
            .iter()
            .find(|(_, name)| *name == value)
            .map(|(tag, _)| *tag)
            .ok_or("unknown event tag")
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typing indicator, rebroadcast with the sender's id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: String,
}

/// Events a client may send that have a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "ai_chat_request")]
    AiChatRequest(ChatRequest),
    #[serde(rename = "typing")]
    Typing(TypingIndicator),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "asset_paste")]
    AssetPaste(AssetPaste),
    #[serde(rename = "asset_attached")]
    AssetAttached(AssetAttached),
    #[serde(rename = "asset_fetch_request")]
    AssetFetchRequest(AssetFetchRequest),
    #[serde(rename = "asset_upload_complete")]
    AssetUploadComplete(AssetUploadComplete),
    #[serde(rename = "asset_upload_progress")]
    AssetUploadProgress(AssetUploadProgress),
}

impl InboundEvent {
    #[must_use]
    pub const fn tag(&self) -> EventTag {
        match self {
            Self::AiChatRequest(_) => EventTag::AiChatRequest,
            Self::Typing(_) => EventTag::Typing,
            Self::Ping => EventTag::Ping,
            Self::AssetPaste(_) => EventTag::AssetPaste,
            Self::AssetAttached(_) => EventTag::AssetAttached,
            Self::AssetFetchRequest(_) => EventTag::AssetFetchRequest,
            Self::AssetUploadComplete(_) => EventTag::AssetUploadComplete,
            Self::AssetUploadProgress(_) => EventTag::AssetUploadProgress,
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// A routable event.
    Event(Box<InboundEvent>),
    /// A known tag with no handler.
    Unhandled(EventTag),
}

/// Why a frame was rejected with the generic invalid-message reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    Encoding,
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("malformed `{tag}` payload: {reason}")]
    Payload { tag: EventTag, reason: String },
}

/// Decodes a text frame and checks its tag against the known set.
///
/// # Errors
/// Returns [`FrameError`] for malformed JSON, a missing or unknown `type`, or a
/// routable tag whose payload does not match its schema.
pub fn parse_frame(text: &str) -> Result<ParsedFrame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Json(err.to_string()))?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;
    let tag = EventTag::try_from(tag).map_err(|_| FrameError::UnknownType(tag.to_string()))?;

    if !tag.is_routable() {
        return Ok(ParsedFrame::Unhandled(tag));
    }

    serde_json::from_value::<InboundEvent>(value)
        .map(|event| ParsedFrame::Event(Box::new(event)))
        .map_err(|err| FrameError::Payload {
            tag,
            reason: err.to_string(),
        })
}

/// Context repeated on every chat stream event so a listener never needs to
/// cross-reference another event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamContext {
    pub conversation_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// One content or thinking delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunk {
    #[serde(flatten)]
    pub context: StreamContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thinking: Option<bool>,
    /// Milliseconds; absent until the thinking phase closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration: Option<u64>,
    pub done: bool,
}

/// Terminal success event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(flatten)]
    pub context: StreamContext,
    pub chunk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration: Option<u64>,
    /// Total tokens when the provider reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
    pub done: bool,
}

/// Binary payload (usually an image) emitted mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatInlineData {
    #[serde(flatten)]
    pub context: StreamContext,
    /// Base64 encoded bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub done: bool,
}

/// Terminal failure event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    #[serde(flatten)]
    pub context: StreamContext,
    pub message: String,
    pub done: bool,
}

/// Published on the user channel once a sentinel chat gets its real id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Announces that buffered output is being replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamResumed {
    pub conversation_id: String,
    pub resumed_at: usize,
    pub chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

/// Events the server emits directly or through fanout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "ai_chat_chunk")]
    AiChatChunk(ChatChunk),
    #[serde(rename = "ai_chat_response")]
    AiChatResponse(ChatResponse),
    #[serde(rename = "ai_chat_error")]
    AiChatError(ChatError),
    #[serde(rename = "ai_chat_inline_data")]
    AiChatInlineData(ChatInlineData),
    #[serde(rename = "conversation:created")]
    ConversationCreated(ConversationCreated),
    #[serde(rename = "stream:resumed")]
    StreamResumed(StreamResumed),
    #[serde(rename = "asset_upload_instructions")]
    AssetUploadInstructions(AssetUploadInstructions),
    #[serde(rename = "asset_upload_progress")]
    AssetUploadProgress(AssetUploadProgress),
    #[serde(rename = "asset_ready")]
    AssetReady(AssetReady),
    #[serde(rename = "asset_upload_error")]
    AssetUploadError(AssetUploadError),
    #[serde(rename = "asset_fetch_response")]
    AssetFetchResponse(AssetFetchResponse),
    #[serde(rename = "asset_fetch_error")]
    AssetFetchError(AssetFetchError),
    #[serde(rename = "typing")]
    Typing(TypingIndicator),
    #[serde(rename = "pong")]
    #[serde(rename_all = "camelCase")]
    Pong { user_id: String },
}

impl OutboundEvent {
    #[must_use]
    pub const fn tag(&self) -> EventTag {
        match self {
            Self::AiChatChunk(_) => EventTag::AiChatChunk,
            Self::AiChatResponse(_) => EventTag::AiChatResponse,
            Self::AiChatError(_) => EventTag::AiChatError,
            Self::AiChatInlineData(_) => EventTag::AiChatInlineData,
            Self::ConversationCreated(_) => EventTag::ConversationCreated,
            Self::StreamResumed(_) => EventTag::StreamResumed,
            Self::AssetUploadInstructions(_) => EventTag::AssetUploadInstructions,
            Self::AssetUploadProgress(_) => EventTag::AssetUploadProgress,
            Self::AssetReady(_) => EventTag::AssetReady,
            Self::AssetUploadError(_) => EventTag::AssetUploadError,
            Self::AssetFetchResponse(_) => EventTag::AssetFetchResponse,
            Self::AssetFetchError(_) => EventTag::AssetFetchError,
            Self::Typing(_) => EventTag::Typing,
            Self::Pong { .. } => EventTag::Pong,
        }
    }

    /// Serializes the event to its JSON wire form.
    ///
    /// # Errors
    /// Returns the serializer error; only non-finite floats can trigger it.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Generic reply for frames that fail [`parse_frame`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidMessageReply {
    pub error: String,
}

impl Default for InvalidMessageReply {
    fn default() -> Self {
        Self {
            error: "Invalid message".to_string(),
        }
    }
}

/// Current time in epoch milliseconds, the timestamp unit used on the wire.
#[must_use]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Telemetry record published for known tags without a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnhandledEventNotice {
    pub event: String,
    #[serde(rename = "type")]
    pub tag: String,
    pub user_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> StreamContext {
        StreamContext {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            provider: Provider::Anthropic,
            model: "claude-sonnet-4-20250514".into(),
            ..StreamContext::default()
        }
    }

    #[test]
    fn parses_routable_event() {
        let parsed =
            parse_frame(r#"{"type":"ai_chat_request","conversationId":"new-chat","prompt":"hi"}"#)
                .unwrap();
        let ParsedFrame::Event(event) = parsed else {
            panic!("expected routable event");
        };
        assert_eq!(event.tag(), EventTag::AiChatRequest);
    }

    #[test]
    fn ping_ignores_extra_fields() {
        let parsed = parse_frame(r#"{"type":"ping","at":1}"#).unwrap();
        assert_eq!(parsed, ParsedFrame::Event(Box::new(InboundEvent::Ping)));
    }

    #[test]
    fn known_tag_without_handler_is_unhandled() {
        let parsed = parse_frame(r#"{"type":"ai_chat_chunk","chunk":"x"}"#).unwrap();
        assert_eq!(parsed, ParsedFrame::Unhandled(EventTag::AiChatChunk));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(parse_frame("not json"), Err(FrameError::Json(_))));
        assert_eq!(parse_frame(r#"{"prompt":"x"}"#), Err(FrameError::MissingType));
        assert_eq!(parse_frame(r#"{"type":7}"#), Err(FrameError::MissingType));
        assert_eq!(
            parse_frame(r#"{"type":"launch_rockets"}"#),
            Err(FrameError::UnknownType("launch_rockets".into()))
        );
        assert!(matches!(
            parse_frame(r#"{"type":"ai_chat_request"}"#),
            Err(FrameError::Payload {
                tag: EventTag::AiChatRequest,
                ..
            })
        ));
    }

    #[test]
    fn chunk_omits_unset_duration() {
        let event = OutboundEvent::AiChatChunk(ChatChunk {
            context: context(),
            chunk: None,
            thinking_text: Some("hmm".into()),
            is_thinking: Some(true),
            thinking_duration: None,
            done: false,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ai_chat_chunk");
        assert_eq!(value["thinkingText"], "hmm");
        assert_eq!(value["provider"], "anthropic");
        assert!(value.get("thinkingDuration").is_none());
        assert!(value.get("chunk").is_none());
    }

    #[test]
    fn zero_duration_is_serialized() {
        let event = OutboundEvent::AiChatResponse(ChatResponse {
            context: context(),
            chunk: "done".into(),
            thinking_text: None,
            thinking_duration: Some(0),
            usage: None,
            done: true,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["thinkingDuration"], json!(0));
        assert_eq!(value["done"], json!(true));
    }

    #[test]
    fn colon_tags_round_trip() {
        let event = OutboundEvent::ConversationCreated(ConversationCreated {
            conversation_id: "c9".into(),
            user_id: "u1".into(),
            title: "New Chat".into(),
            timestamp: 1,
        });
        let text = event.to_json().unwrap();
        assert!(text.contains(r#""type":"conversation:created""#));
        assert_eq!(serde_json::from_str::<OutboundEvent>(&text).unwrap(), event);
    }

    #[test]
    fn pong_carries_user_id() {
        let value = serde_json::to_value(OutboundEvent::Pong {
            user_id: "u7".into(),
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "pong", "userId": "u7" }));
    }
}
