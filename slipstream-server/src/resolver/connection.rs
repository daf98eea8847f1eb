use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// Direct delivery path to one client.
///
/// The transport owns the receiving half and writes frames to the socket. A
/// closed receiver only stops direct delivery; callers keep running.
#[derive(Debug, Clone)]
pub struct Connection {
    user_id: Arc<str>,
    tx: mpsc::Sender<Arc<str>>,
}

impl Connection {
    #[must_use]
    pub fn new(user_id: &str, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            user_id: Arc::from(user_id),
            tx,
        }
    }

    /// Creates a connection together with the queue its writer drains.
    #[must_use]
    pub fn channel(user_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(user_id, tx), rx)
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues a serialized frame. Returns `false` once the client is gone.
    pub async fn send_raw(&self, payload: Arc<str>) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) => {
                trace!(user_id = %self.user_id, "connection queue full; waiting");
                self.tx.send(payload).await.is_ok()
            }
            Err(TrySendError::Closed(_)) => {
                trace!(user_id = %self.user_id, "connection closed; dropping frame");
                false
            }
        }
    }

    /// Serializes and queues one event.
    pub async fn send<T: Serialize + ?Sized>(&self, event: &T) -> bool {
        match serde_json::to_string(event) {
            Ok(payload) => self.send_raw(Arc::from(payload)).await,
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "dropping unserializable event");
                false
            }
        }
    }
}
