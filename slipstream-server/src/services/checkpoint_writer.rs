use std::sync::Arc;

use metrics::counter;
use shared::models::PersistedCheckpoint;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use super::checkpoint_store::CheckpointStore;

enum CheckpointOp {
    Save(PersistedCheckpoint),
    Delete,
    Flush(oneshot::Sender<()>),
}

/// Runs checkpoint writes off the chunk delivery path.
///
/// Each stream gets a [`CheckpointSession`] whose operations are applied in
/// order by one background task, so a late save can never land after the
/// terminal delete. A shared semaphore caps writes in flight across streams.
#[derive(Clone)]
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>, max_in_flight: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.store)
    }

    /// Starts the ordered write queue for one conversation.
    #[must_use]
    pub fn session(&self, conversation_id: &str) -> CheckpointSession {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(
            Arc::clone(&self.store),
            Arc::clone(&self.permits),
            conversation_id.to_string(),
            rx,
        ));

        CheckpointSession {
            conversation_id: conversation_id.to_string(),
            tx,
        }
    }
}

async fn drain(
    store: Arc<dyn CheckpointStore>,
    permits: Arc<Semaphore>,
    conversation_id: String,
    mut rx: mpsc::UnboundedReceiver<CheckpointOp>,
) {
    while let Some(op) = rx.recv().await {
        if let CheckpointOp::Flush(ack) = op {
            let _ = ack.send(());
            continue;
        }

        let Ok(_permit) = permits.acquire().await else {
            warn!(conversation_id = %conversation_id, "checkpoint writer closed");
            return;
        };

        match op {
            CheckpointOp::Save(checkpoint) => match store.save(&conversation_id, &checkpoint).await {
                Ok(()) => {
                    counter!("slipstream_checkpoint_writes_total").increment(1);
                    debug!(
                        conversation_id = %conversation_id,
                        chunks = checkpoint.chunks.len(),
                        completed = checkpoint.metadata.completed,
                        "checkpoint saved"
                    );
                }
                Err(err) => {
                    counter!("slipstream_checkpoint_write_failures_total").increment(1);
                    warn!(conversation_id = %conversation_id, error = %err, "checkpoint save failed");
                }
            },
            CheckpointOp::Delete => {
                if let Err(err) = store.delete(&conversation_id).await {
                    counter!("slipstream_checkpoint_write_failures_total").increment(1);
                    warn!(conversation_id = %conversation_id, error = %err, "checkpoint delete failed");
                }
            }
            CheckpointOp::Flush(_) => {}
        }
    }
}

/// Ordered checkpoint queue for one stream.
#[derive(Debug, Clone)]
pub struct CheckpointSession {
    conversation_id: String,
    tx: mpsc::UnboundedSender<CheckpointOp>,
}

impl std::fmt::Debug for CheckpointOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Save(checkpoint) => write!(f, "Save({} chunks)", checkpoint.chunks.len()),
            Self::Delete => f.write_str("Delete"),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl CheckpointSession {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Queues a save without waiting for it.
    pub fn save(&self, checkpoint: PersistedCheckpoint) {
        self.enqueue(CheckpointOp::Save(checkpoint));
    }

    /// Queues the terminal delete.
    pub fn delete(&self) {
        self.enqueue(CheckpointOp::Delete);
    }

    /// Waits until every operation queued so far has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.enqueue(CheckpointOp::Flush(ack));
        let _ = done.await;
    }

    fn enqueue(&self, op: CheckpointOp) {
        if self.tx.send(op).is_err() {
            warn!(conversation_id = %self.conversation_id, "checkpoint queue closed; operation dropped");
        }
    }
}
