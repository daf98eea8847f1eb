use thiserror::Error;

use crate::{
    providers::AdapterError,
    services::{
        checkpoint_store::CheckpointError, lease::LeaseHeld, persistence::PersistenceError,
        storage::StorageError,
    },
};

/// Failures a handler reports back to the client.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("A response is already streaming for this conversation")]
    LeaseHeld(#[from] LeaseHeld),
    #[error("{0}")]
    Rejected(String),
}

pub type ResolverResult<T> = Result<T, ResolverError>;

/// Client-facing message for an error.
///
/// Only the top-level message is exposed; source chains and debug output stay
/// in the logs.
#[must_use]
pub fn safe_error_message(err: &(dyn std::error::Error + 'static)) -> String {
    let message = err.to_string();
    if message.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}

/// Client-facing rendering of an arbitrary JSON error payload.
///
/// Strings print as-is, other primitives print directly and structured values
/// are serialized.
#[must_use]
pub fn safe_value_message(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
