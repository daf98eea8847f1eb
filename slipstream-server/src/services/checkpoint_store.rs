use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use shared::models::{PersistedCheckpoint, checkpoint_key};
use sqlx::{PgPool, types::Json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Key-value storage for stream checkpoints, keyed by conversation id.
///
/// Writes are last-writer-wins; single-writer-per-conversation is enforced by
/// the lease registry, not here.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> CheckpointResult<Option<PersistedCheckpoint>>;
    async fn save(
        &self,
        conversation_id: &str,
        checkpoint: &PersistedCheckpoint,
    ) -> CheckpointResult<()>;
    async fn delete(&self, conversation_id: &str) -> CheckpointResult<()>;
}

/// Process-local store used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<HashMap<String, PersistedCheckpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, conversation_id: &str) -> CheckpointResult<Option<PersistedCheckpoint>> {
        let guard = self.entries.read().await;
        Ok(guard.get(&checkpoint_key(conversation_id)).cloned())
    }

    async fn save(
        &self,
        conversation_id: &str,
        checkpoint: &PersistedCheckpoint,
    ) -> CheckpointResult<()> {
        let mut guard = self.entries.write().await;
        guard.insert(checkpoint_key(conversation_id), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> CheckpointResult<()> {
        let mut guard = self.entries.write().await;
        guard.remove(&checkpoint_key(conversation_id));
        Ok(())
    }
}

/// Postgres-backed store. Rows older than `ttl` are treated as absent.
#[derive(Clone, Debug)]
pub struct PgCheckpointStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgCheckpointStore {
    #[must_use]
    pub const fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    fn ttl_seconds(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, conversation_id: &str) -> CheckpointResult<Option<PersistedCheckpoint>> {
        let row: Option<(Json<PersistedCheckpoint>,)> = sqlx::query_as(
            "SELECT payload FROM slipstream.stream_checkpoints \
             WHERE conversation_id = $1 \
               AND ($2::bigint = 0 OR updated_at > now() - ($2::bigint * interval '1 second'))",
        )
        .bind(conversation_id)
        .bind(self.ttl_seconds())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(checkpoint),)| checkpoint))
    }

    async fn save(
        &self,
        conversation_id: &str,
        checkpoint: &PersistedCheckpoint,
    ) -> CheckpointResult<()> {
        let payload = serde_json::to_value(checkpoint)?;
        sqlx::query(
            "INSERT INTO slipstream.stream_checkpoints (conversation_id, payload, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (conversation_id) \
             DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at",
        )
        .bind(conversation_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        trace!(
            conversation_id,
            chunks = checkpoint.chunks.len(),
            "persisted stream checkpoint"
        );
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> CheckpointResult<()> {
        sqlx::query("DELETE FROM slipstream.stream_checkpoints WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
