//! # Wire models
//!
//! Types shared between the resolver, the fanout subscribers, and the
//! checkpoint store.

pub mod attachment;
pub mod channel;
pub mod chat;
pub mod checkpoint;
pub mod events;

pub use attachment::{AssetOrigin, AssetStatus, s3_object_id};
pub use channel::{Channel, resolve_channel};
pub use chat::{ChatRequest, NEW_CHAT_SENTINEL, Provider, SenderType, is_new_chat};
pub use checkpoint::{CheckpointMetadata, PersistedCheckpoint, checkpoint_key};
pub use events::{
    ChatChunk, ChatError, ChatInlineData, ChatResponse, ConversationCreated, EventTag, FrameError,
    InboundEvent, InvalidMessageReply, OutboundEvent, ParsedFrame, StreamContext, StreamResumed,
    TypingIndicator, UnhandledEventNotice, epoch_millis, parse_frame,
};
