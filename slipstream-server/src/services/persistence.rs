//! Conversation, message, and attachment records.
//!
//! The resolver only talks to [`ConversationStore`]; Postgres and in-memory
//! implementations live here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{AssetOrigin, AssetStatus, ChatRequest, Provider, SenderType};
use sqlx::{PgPool, Row, postgres::PgRow};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("stored value is malformed: {0}")]
    Serialization(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Conversation row as seen by the resolver after the user turn is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub title: Option<String>,
    /// True when this call minted the conversation.
    pub created: bool,
    pub created_at: DateTime<Utc>,
}

/// One prior turn used to build upstream history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sender: SenderType,
    pub content: String,
    pub provider: Option<Provider>,
    pub model: Option<String>,
}

/// Finished assistant output handed over on the terminal signal.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub model: String,
    pub text: String,
    pub thinking_text: Option<String>,
    pub thinking_duration_ms: Option<u64>,
    pub total_tokens: Option<u64>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub s3_object_id: Option<String>,
    pub etag: Option<String>,
    pub origin: AssetOrigin,
    pub status: AssetStatus,
    pub source_url: Option<String>,
}

/// Relational persistence collaborator.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Stores the user prompt, creating the conversation when the request
    /// carries the sentinel id or an id that does not exist yet.
    async fn record_user_turn(
        &self,
        user_id: &str,
        request: &ChatRequest,
    ) -> PersistenceResult<ConversationRecord>;

    /// Prior turns, oldest first.
    async fn history(&self, conversation_id: &str) -> PersistenceResult<Vec<StoredMessage>>;

    async fn set_title(&self, conversation_id: &str, title: &str) -> PersistenceResult<()>;

    async fn record_assistant_turn(&self, message: &FinalMessage) -> PersistenceResult<()>;

    /// A key the user saved for this provider, if any.
    async fn api_key(&self, user_id: &str, provider: Provider) -> PersistenceResult<Option<String>>;

    async fn create_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()>;

    /// Replaces the mutable fields (status, size, version, etag, object id).
    async fn update_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()>;

    async fn get_attachment(&self, id: &str) -> PersistenceResult<Option<AttachmentRecord>>;
}

#[derive(Debug, Clone)]
struct MemoryConversation {
    user_id: String,
    title: Option<String>,
    created_at: DateTime<Utc>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<String, MemoryConversation>,
    api_keys: HashMap<(String, Provider), String>,
    attachments: HashMap<String, AttachmentRecord>,
}

/// Store used when no database is configured and by the integration tests.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    state: RwLock<MemoryState>,
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_api_key(&self, user_id: &str, provider: Provider, key: &str) {
        let mut state = self.state.write().await;
        state
            .api_keys
            .insert((user_id.to_string(), provider), key.to_string());
    }

    /// The owner recorded for a conversation.
    pub async fn owner(&self, conversation_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.user_id.clone())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn record_user_turn(
        &self,
        user_id: &str,
        request: &ChatRequest,
    ) -> PersistenceResult<ConversationRecord> {
        let mut state = self.state.write().await;

        let (id, created) = if !request.is_new_chat()
            && state.conversations.contains_key(&request.conversation_id)
        {
            (request.conversation_id.clone(), false)
        } else {
            let id = if request.is_new_chat() {
                Uuid::new_v4().to_string()
            } else {
                request.conversation_id.clone()
            };
            state.conversations.insert(
                id.clone(),
                MemoryConversation {
                    user_id: user_id.to_string(),
                    title: None,
                    created_at: Utc::now(),
                    messages: Vec::new(),
                },
            );
            (id, true)
        };

        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                entity: "conversation",
                id: id.clone(),
            })?;
        conversation.messages.push(StoredMessage {
            sender: SenderType::User,
            content: request.prompt.clone(),
            provider: Some(request.provider),
            model: Some(request.resolved_model()),
        });

        Ok(ConversationRecord {
            id,
            title: conversation.title.clone(),
            created,
            created_at: conversation.created_at,
        })
    }

    async fn history(&self, conversation_id: &str) -> PersistenceResult<Vec<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default())
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> PersistenceResult<()> {
        let mut state = self.state.write().await;
        let conversation = state.conversations.get_mut(conversation_id).ok_or_else(|| {
            PersistenceError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            }
        })?;
        conversation.title = Some(title.to_string());
        Ok(())
    }

    async fn record_assistant_turn(&self, message: &FinalMessage) -> PersistenceResult<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| PersistenceError::NotFound {
                entity: "conversation",
                id: message.conversation_id.clone(),
            })?;
        conversation.messages.push(StoredMessage {
            sender: SenderType::Ai,
            content: message.text.clone(),
            provider: Some(message.provider),
            model: Some(message.model.clone()),
        });
        if let Some(title) = &message.title {
            conversation.title = Some(title.clone());
        }
        Ok(())
    }

    async fn api_key(&self, user_id: &str, provider: Provider) -> PersistenceResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state
            .api_keys
            .get(&(user_id.to_string(), provider))
            .cloned())
    }

    async fn create_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()> {
        let mut state = self.state.write().await;
        state.attachments.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()> {
        let mut state = self.state.write().await;
        let existing =
            state
                .attachments
                .get_mut(&record.id)
                .ok_or_else(|| PersistenceError::NotFound {
                    entity: "attachment",
                    id: record.id.clone(),
                })?;
        *existing = record.clone();
        Ok(())
    }

    async fn get_attachment(&self, id: &str) -> PersistenceResult<Option<AttachmentRecord>> {
        let state = self.state.read().await;
        Ok(state.attachments.get(id).cloned())
    }
}

/// Postgres implementation over the `slipstream` schema.
#[derive(Clone, Debug)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn attachment_from_row(row: &PgRow) -> PersistenceResult<AttachmentRecord> {
    let origin: String = row.try_get("origin")?;
    let status: String = row.try_get("status")?;
    let size: i64 = row.try_get("size")?;

    Ok(AttachmentRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        filename: row.try_get("filename")?,
        mime: row.try_get("mime")?,
        size: u64::try_from(size).unwrap_or_default(),
        bucket: row.try_get("bucket")?,
        key: row.try_get("object_key")?,
        version_id: row.try_get("version_id")?,
        s3_object_id: row.try_get("s3_object_id")?,
        etag: row.try_get("etag")?,
        origin: AssetOrigin::try_from(origin.as_str())
            .map_err(|err| PersistenceError::Serialization(format!("{err}: {origin}")))?,
        status: AssetStatus::try_from(status.as_str())
            .map_err(|err| PersistenceError::Serialization(format!("{err}: {status}")))?,
        source_url: row.try_get("source_url")?,
    })
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn record_user_turn(
        &self,
        user_id: &str,
        request: &ChatRequest,
    ) -> PersistenceResult<ConversationRecord> {
        let mut tx = self.pool.begin().await?;

        let existing = if request.is_new_chat() {
            None
        } else {
            sqlx::query(
                "UPDATE slipstream.conversations \
                 SET system_prompt = COALESCE($2, system_prompt), \
                     temperature = COALESCE($3, temperature), \
                     top_p = COALESCE($4, top_p), \
                     updated_at = now() \
                 WHERE id = $1 \
                 RETURNING title, created_at",
            )
            .bind(&request.conversation_id)
            .bind(&request.system_prompt)
            .bind(request.temperature)
            .bind(request.top_p)
            .fetch_optional(&mut *tx)
            .await?
        };

        let record = if let Some(row) = existing {
            ConversationRecord {
                id: request.conversation_id.clone(),
                title: row.try_get("title")?,
                created: false,
                created_at: row.try_get("created_at")?,
            }
        } else {
            let id = if request.is_new_chat() {
                Uuid::new_v4().to_string()
            } else {
                request.conversation_id.clone()
            };
            let created_at: DateTime<Utc> = sqlx::query_scalar(
                "INSERT INTO slipstream.conversations (id, user_id, system_prompt, temperature, top_p) \
                 VALUES ($1, $2, $3, $4, $5) \
                 RETURNING created_at",
            )
            .bind(&id)
            .bind(user_id)
            .bind(&request.system_prompt)
            .bind(request.temperature)
            .bind(request.top_p)
            .fetch_one(&mut *tx)
            .await?;
            ConversationRecord {
                id,
                title: None,
                created: true,
                created_at,
            }
        };

        sqlx::query(
            "INSERT INTO slipstream.messages (id, conversation_id, user_id, sender_type, content, provider, model) \
             VALUES ($1, $2, $3, 'USER', $4, $5, $6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.id)
        .bind(user_id)
        .bind(&request.prompt)
        .bind(request.provider.as_str())
        .bind(request.resolved_model())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        trace!(conversation_id = %record.id, created = record.created, "recorded user turn");
        Ok(record)
    }

    async fn history(&self, conversation_id: &str) -> PersistenceResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT sender_type, content, provider, model FROM slipstream.messages \
             WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let sender: String = row.try_get("sender_type")?;
                let provider: Option<String> = row.try_get("provider")?;
                Ok(StoredMessage {
                    sender: SenderType::try_from(sender.as_str()).map_err(|err| {
                        PersistenceError::Serialization(format!("{err}: {sender}"))
                    })?,
                    content: row.try_get("content")?,
                    provider: provider
                        .as_deref()
                        .and_then(|value| Provider::try_from(value).ok()),
                    model: row.try_get("model")?,
                })
            })
            .collect()
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> PersistenceResult<()> {
        let result = sqlx::query(
            "UPDATE slipstream.conversations SET title = $2, updated_at = now() WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(title)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_assistant_turn(&self, message: &FinalMessage) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO slipstream.messages \
             (id, conversation_id, user_id, sender_type, content, thinking_text, thinking_duration_ms, total_tokens, provider, model) \
             VALUES ($1, $2, $3, 'AI', $4, $5, $6, $7, $8, $9)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&message.conversation_id)
        .bind(&message.user_id)
        .bind(&message.text)
        .bind(&message.thinking_text)
        .bind(message.thinking_duration_ms.map(to_i64))
        .bind(message.total_tokens.map(to_i64))
        .bind(message.provider.as_str())
        .bind(&message.model)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE slipstream.conversations \
             SET title = COALESCE($2, title), updated_at = now() WHERE id = $1",
        )
        .bind(&message.conversation_id)
        .bind(&message.title)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn api_key(&self, user_id: &str, provider: Provider) -> PersistenceResult<Option<String>> {
        let key = sqlx::query_scalar(
            "SELECT api_key FROM slipstream.provider_keys WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn create_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()> {
        sqlx::query(
            "INSERT INTO slipstream.attachments \
             (id, user_id, conversation_id, message_id, filename, mime, size, bucket, object_key, \
              version_id, s3_object_id, etag, origin, status, source_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.conversation_id)
        .bind(&record.message_id)
        .bind(&record.filename)
        .bind(&record.mime)
        .bind(to_i64(record.size))
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(&record.version_id)
        .bind(&record.s3_object_id)
        .bind(&record.etag)
        .bind(record.origin.as_str())
        .bind(record.status.as_str())
        .bind(&record.source_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attachment(&self, record: &AttachmentRecord) -> PersistenceResult<()> {
        let result = sqlx::query(
            "UPDATE slipstream.attachments \
             SET status = $2, size = $3, version_id = $4, s3_object_id = $5, etag = $6, \
                 message_id = COALESCE($7, message_id), updated_at = now() \
             WHERE id = $1",
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(to_i64(record.size))
        .bind(&record.version_id)
        .bind(&record.s3_object_id)
        .bind(&record.etag)
        .bind(&record.message_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                entity: "attachment",
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_attachment(&self, id: &str) -> PersistenceResult<Option<AttachmentRecord>> {
        let row = sqlx::query("SELECT * FROM slipstream.attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attachment_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(conversation_id: &str, prompt: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "conversationId": conversation_id,
            "prompt": prompt,
            "provider": "anthropic"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn sentinel_mints_a_new_conversation_each_time() {
        let store = InMemoryConversationStore::new();
        let first = store.record_user_turn("u1", &request("new-chat", "a")).await.unwrap();
        let second = store.record_user_turn("u1", &request("new-chat", "b")).await.unwrap();

        assert!(first.created && second.created);
        assert_ne!(first.id, second.id);
        assert_eq!(store.owner(&first.id).await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn existing_conversation_keeps_title_and_history() {
        let store = InMemoryConversationStore::new();
        let record = store.record_user_turn("u1", &request("new-chat", "hi")).await.unwrap();
        store.set_title(&record.id, "Greetings").await.unwrap();
        store
            .record_assistant_turn(&FinalMessage {
                conversation_id: record.id.clone(),
                user_id: "u1".into(),
                provider: Provider::Anthropic,
                model: "claude-sonnet-4-20250514".into(),
                text: "hello!".into(),
                thinking_text: None,
                thinking_duration_ms: None,
                total_tokens: Some(12),
                title: None,
            })
            .await
            .unwrap();

        let again = store.record_user_turn("u1", &request(&record.id, "more")).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.title.as_deref(), Some("Greetings"));

        let history = store.history(&record.id).await.unwrap();
        let senders: Vec<_> = history.iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec![SenderType::User, SenderType::Ai, SenderType::User]);
    }

    #[tokio::test]
    async fn updating_unknown_attachment_is_not_found() {
        let store = InMemoryConversationStore::new();
        let record = AttachmentRecord {
            id: "a1".into(),
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            message_id: None,
            filename: "x.png".into(),
            mime: "image/png".into(),
            size: 0,
            bucket: "b".into(),
            key: "k".into(),
            version_id: None,
            s3_object_id: None,
            etag: None,
            origin: AssetOrigin::Upload,
            status: AssetStatus::Requested,
            source_url: None,
        };

        assert!(matches!(
            store.update_attachment(&record).await,
            Err(PersistenceError::NotFound { .. })
        ));
        store.create_attachment(&record).await.unwrap();
        assert_eq!(store.get_attachment("a1").await.unwrap(), Some(record));
    }
}
