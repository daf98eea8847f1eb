use serde::{Deserialize, Serialize};

use super::chat::Provider;

/// Request context stored next to buffered chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub total_chunks: usize,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// Snapshot of a stream's buffered output, keyed by conversation id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCheckpoint {
    pub chunks: Vec<String>,
    #[serde(default)]
    pub thinking_chunks: Vec<String>,
    pub metadata: CheckpointMetadata,
}

impl PersistedCheckpoint {
    /// An unfinished checkpoint has to be replayed before a new upstream call.
    #[must_use]
    pub const fn is_resumable(&self) -> bool {
        !self.metadata.completed
    }

    /// Buffered content concatenated in emission order.
    #[must_use]
    pub fn replay_text(&self) -> String {
        self.chunks.concat()
    }
}

/// Key used by key-value backed checkpoint stores.
#[must_use]
pub fn checkpoint_key(conversation_id: &str) -> String {
    format!("stream:state:{conversation_id}")
}
