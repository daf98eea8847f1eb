//! Conversation history as sent upstream.
//!
//! Continuing chats replay prior turns with assistant output tagged by the
//! model that produced it, so a conversation can move between providers.

use serde::Serialize;
use shared::models::SenderType;

use super::AdapterRequest;

const TAG_NOTE: &str = "Previous responses may be tagged with their source model for context in the form of [PROVIDER/MODEL] notation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Messages for the upstream call: tagged history then the prompt, or only the
/// prompt for a new chat.
#[must_use]
pub fn turns(request: &AdapterRequest) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(request.history.len() + 1);

    if !request.is_new_chat {
        turns.extend(request.history.iter().map(|message| match message.sender {
            SenderType::User => Turn {
                role: Role::User,
                content: message.content.clone(),
            },
            SenderType::Ai => Turn {
                role: Role::Assistant,
                content: match (message.provider, message.model.as_deref()) {
                    (Some(provider), Some(model)) => {
                        format!("[{provider}/{model}] \n{}", message.content)
                    }
                    _ => message.content.clone(),
                },
            },
        }));
    }

    turns.push(Turn {
        role: Role::User,
        content: request.prompt.clone(),
    });
    turns
}

/// System instructions for the upstream call.
///
/// New chats carry only the caller's system prompt. Continuing chats always get
/// the note explaining the `[provider/model]` tags.
#[must_use]
pub fn instructions(request: &AdapterRequest) -> Option<String> {
    let system_prompt = request
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty());

    if request.is_new_chat {
        return system_prompt.map(str::to_string);
    }

    Some(match system_prompt {
        Some(prompt) => format!("{prompt}\n\nNote: {TAG_NOTE}"),
        None => "Previous responses in this conversation may be tagged with their source model for context in the form of [PROVIDER/MODEL] notation.".to_string(),
    })
}

/// Chat-completions style message list with the system text as the first message.
#[must_use]
pub fn chat_messages(request: &AdapterRequest, system: Option<String>) -> Vec<Turn> {
    system
        .map(|content| Turn {
            role: Role::System,
            content,
        })
        .into_iter()
        .chain(turns(request))
        .collect()
}
