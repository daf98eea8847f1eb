use serde::{Deserialize, Serialize};

use super::chat::is_new_chat;

/// Fanout topic a stream event is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Channel {
    /// Everything addressed to one user, including streams for chats not yet created.
    User(String),
    /// Subscribers following one conversation.
    Conversation(String),
    /// Process-wide broadcast topic.
    Global(String),
}

impl Channel {
    /// Wire name of the topic (`user:{id}`, `stream:{id}`, or the global name verbatim).
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::User(user_id) => format!("user:{user_id}"),
            Self::Conversation(conversation_id) => format!("stream:{conversation_id}"),
            Self::Global(name) => name.clone(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Picks the fanout channel for a stream.
///
/// The sentinel conversation id has no conversation-scoped subscribers yet, so
/// its events go to the user channel. Any real id maps to the conversation
/// channel regardless of the user.
#[must_use]
pub fn resolve_channel(conversation_id: &str, user_id: &str) -> Channel {
    if is_new_chat(conversation_id) {
        Channel::User(user_id.to_string())
    } else {
        Channel::Conversation(conversation_id.to_string())
    }
}
