//! Attachment events: presigned uploads, finalize, and server-side fetches.

use std::{path::Path, time::Duration};

use axum::body::Bytes;
use metrics::counter;
use serde::Serialize;
use shared::models::{
    AssetOrigin, AssetStatus, Channel, OutboundEvent, epoch_millis, resolve_channel, s3_object_id,
    attachment::{
        AssetAttached, AssetFetchError, AssetFetchRequest, AssetFetchResponse, AssetPaste,
        AssetReady, AssetUploadComplete, AssetUploadError, AssetUploadInstructions,
        AssetUploadProgress,
    },
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{
    Resolver,
    connection::Connection,
    errors::{ResolverError, ResolverResult, safe_error_message},
};
use crate::services::persistence::{AttachmentRecord, PersistenceError};

const DEFAULT_MIME: &str = "application/octet-stream";

/// A client-side file the server should issue an upload URL for.
struct UploadIntent {
    conversation_id: String,
    filename: String,
    mime: String,
    size: u64,
    message_id: Option<String>,
    origin: AssetOrigin,
}

/// A failed remote fetch, with the remote status when there was one.
struct FetchFailure {
    attachment_id: Option<String>,
    status_code: Option<u16>,
    error: ResolverError,
}

impl FetchFailure {
    fn new(error: impl Into<ResolverError>) -> Self {
        Self {
            attachment_id: None,
            status_code: None,
            error: error.into(),
        }
    }
}

/// Mime from the event, or guessed from the filename.
fn resolve_mime(filename: &str, mime: &str) -> String {
    let mime = mime.trim();
    if mime.is_empty() {
        mime_guess::from_path(filename)
            .first_raw()
            .unwrap_or(DEFAULT_MIME)
            .to_string()
    } else {
        mime.to_string()
    }
}

/// Appends an extension derived from `mime` when the filename has none.
fn with_extension(filename: &str, mime: &str) -> String {
    let filename = filename.trim().replace('/', "_");
    let filename = if filename.is_empty() {
        "file".to_string()
    } else {
        filename
    };

    if Path::new(&filename).extension().is_some() {
        return filename;
    }
    match mime_guess::get_mime_extensions_str(mime).and_then(|exts| exts.first()) {
        Some(ext) => format!("{filename}.{ext}"),
        None => filename,
    }
}

/// Last path segment of a URL, used as the stored filename.
fn remote_filename(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("remote")
        .to_string()
}

impl Resolver {
    fn object_key(&self, user_id: &str, filename: &str) -> String {
        format!(
            "{}/{user_id}/{}_{filename}",
            self.settings.storage.key_prefix.trim_end_matches('/'),
            epoch_millis()
        )
    }

    fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.settings.storage.presign_expiry_secs)
    }

    fn download_expires_at(&self) -> i64 {
        let expiry = i64::try_from(self.settings.storage.presign_expiry_secs).unwrap_or(i64::MAX);
        epoch_millis().saturating_add(expiry.saturating_mul(1000))
    }

    async fn send_and_publish<T: Serialize + ?Sized>(
        &self,
        connection: &Connection,
        channel: &Channel,
        event: &T,
    ) {
        connection.send(event).await;
        self.fanout.publish(channel, event).await;
    }

    pub(super) async fn handle_asset_paste(&self, paste: AssetPaste, connection: &Connection) {
        let intent = UploadIntent {
            conversation_id: paste.conversation_id,
            filename: paste.filename,
            mime: paste.mime,
            size: paste.size,
            message_id: None,
            origin: AssetOrigin::Pasted,
        };
        self.request_upload(intent, connection).await;
    }

    pub(super) async fn handle_asset_attached(
        &self,
        attached: AssetAttached,
        connection: &Connection,
    ) {
        let intent = UploadIntent {
            conversation_id: attached.conversation_id,
            filename: attached.filename,
            mime: attached.mime,
            size: attached.size,
            message_id: attached.message_id,
            origin: AssetOrigin::Upload,
        };
        self.request_upload(intent, connection).await;
    }

    async fn request_upload(&self, intent: UploadIntent, connection: &Connection) {
        let conversation_id = intent.conversation_id.clone();
        if let Err(err) = self.issue_upload(intent, connection).await {
            self.upload_failed(&conversation_id, None, &err, connection)
                .await;
        }
    }

    async fn issue_upload(&self, intent: UploadIntent, connection: &Connection) -> ResolverResult<()> {
        let user_id = connection.user_id();
        let mime = resolve_mime(&intent.filename, &intent.mime);
        let filename = with_extension(&intent.filename, &mime);
        let key = self.object_key(user_id, &filename);
        let attachment_id = Uuid::new_v4().to_string();

        let upload = self
            .storage
            .presign_upload(&key, &mime, self.presign_expiry())
            .await?;

        let record = AttachmentRecord {
            id: attachment_id.clone(),
            user_id: user_id.to_string(),
            conversation_id: intent.conversation_id.clone(),
            message_id: intent.message_id,
            filename,
            mime,
            size: intent.size,
            bucket: self.storage.bucket().to_string(),
            key: key.clone(),
            version_id: None,
            s3_object_id: None,
            etag: None,
            origin: intent.origin,
            status: AssetStatus::Requested,
            source_url: None,
        };
        self.conversations.create_attachment(&record).await?;
        counter!("slipstream_asset_uploads_requested_total", "origin" => intent.origin.as_str())
            .increment(1);
        debug!(attachment_id = %attachment_id, key = %key, "issued upload url");

        connection
            .send(&OutboundEvent::AssetUploadInstructions(AssetUploadInstructions {
                conversation_id: intent.conversation_id.clone(),
                attachment_id: attachment_id.clone(),
                method: upload.method,
                upload_url: upload.url,
                required_headers: upload.headers,
                expires_in: upload.expires_in.as_secs(),
                bucket: record.bucket,
                key,
            }))
            .await;

        let progress = OutboundEvent::AssetUploadProgress(AssetUploadProgress {
            conversation_id: intent.conversation_id.clone(),
            attachment_id,
            progress: 0,
            bytes_uploaded: 0,
            total_bytes: intent.size,
        });
        self.fanout
            .publish(&resolve_channel(&intent.conversation_id, user_id), &progress)
            .await;
        Ok(())
    }

    pub(super) async fn handle_asset_upload_progress(
        &self,
        progress: AssetUploadProgress,
        user_id: &str,
    ) {
        let channel = resolve_channel(&progress.conversation_id, user_id);
        self.fanout
            .publish(&channel, &OutboundEvent::AssetUploadProgress(progress))
            .await;
    }

    pub(super) async fn handle_asset_upload_complete(
        &self,
        complete: AssetUploadComplete,
        connection: &Connection,
    ) {
        let conversation_id = complete.conversation_id.clone();
        let attachment_id = complete.attachment_id.clone();
        if let Err(err) = self.finalize_upload(complete, connection).await {
            self.upload_failed(&conversation_id, Some(attachment_id), &err, connection)
                .await;
        }
    }

    async fn finalize_upload(
        &self,
        complete: AssetUploadComplete,
        connection: &Connection,
    ) -> ResolverResult<()> {
        let user_id = connection.user_id();
        let mut record = self
            .conversations
            .get_attachment(&complete.attachment_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound {
                entity: "attachment",
                id: complete.attachment_id.clone(),
            })?;
        if record.user_id != user_id {
            return Err(ResolverError::Rejected(
                "attachment belongs to another user".to_string(),
            ));
        }

        let head = match self.storage.head_object(&record.key).await {
            Ok(head) => head,
            Err(err) => {
                record.status = AssetStatus::Failed;
                if let Err(update) = self.conversations.update_attachment(&record).await {
                    warn!(attachment_id = %record.id, error = %update, "failed to mark attachment failed");
                }
                return Err(err.into());
            }
        };

        let version_id = head.version_id.or(complete.version_id);
        let object_id = s3_object_id(&record.bucket, &record.key, version_id.as_deref());
        record.size = head.size;
        record.etag = head.etag;
        record.version_id = version_id;
        record.s3_object_id = Some(object_id.clone());
        record.status = AssetStatus::Ready;
        self.conversations.update_attachment(&record).await?;

        let download_url = self
            .storage
            .presign_download(&record.key, record.version_id.as_deref(), self.presign_expiry())
            .await?;
        counter!("slipstream_asset_uploads_completed_total").increment(1);
        info!(attachment_id = %record.id, size = record.size, "attachment ready");

        let ready = OutboundEvent::AssetReady(AssetReady {
            conversation_id: complete.conversation_id.clone(),
            attachment_id: record.id,
            bucket: record.bucket,
            key: record.key,
            version_id: record.version_id,
            s3_object_id: object_id,
            etag: record.etag,
            size: record.size,
            mime: record.mime,
            origin: record.origin,
            status: record.status,
            download_url,
            download_url_expires_at: self.download_expires_at(),
        });
        let channel = resolve_channel(&complete.conversation_id, user_id);
        self.send_and_publish(connection, &channel, &ready).await;
        Ok(())
    }

    async fn upload_failed(
        &self,
        conversation_id: &str,
        attachment_id: Option<String>,
        err: &ResolverError,
        connection: &Connection,
    ) {
        counter!("slipstream_asset_errors_total", "kind" => "upload").increment(1);
        warn!(conversation_id, error = %err, "attachment upload failed");
        let channel = resolve_channel(conversation_id, connection.user_id());
        let event = OutboundEvent::AssetUploadError(AssetUploadError {
            user_id: connection.user_id().to_string(),
            conversation_id: conversation_id.to_string(),
            attachment_id,
            success: false,
            error: Some(safe_error_message(err)),
        });
        self.send_and_publish(connection, &channel, &event).await;
    }

    pub(super) async fn handle_asset_fetch(&self, fetch: AssetFetchRequest, connection: &Connection) {
        match self.fetch_remote(&fetch, connection.user_id()).await {
            Ok(response) => {
                let channel = resolve_channel(&fetch.conversation_id, connection.user_id());
                self.send_and_publish(
                    connection,
                    &channel,
                    &OutboundEvent::AssetFetchResponse(response),
                )
                .await;
            }
            Err(failure) => {
                counter!("slipstream_asset_errors_total", "kind" => "fetch").increment(1);
                warn!(
                    source_url = %fetch.source_url,
                    status = ?failure.status_code,
                    error = %failure.error,
                    "remote fetch failed"
                );
                connection
                    .send(&OutboundEvent::AssetFetchError(AssetFetchError {
                        conversation_id: fetch.conversation_id,
                        attachment_id: failure.attachment_id,
                        source_url: Some(fetch.source_url),
                        success: false,
                        status_code: failure.status_code,
                        error: Some(safe_error_message(&failure.error)),
                    }))
                    .await;
            }
        }
    }

    async fn fetch_remote(
        &self,
        fetch: &AssetFetchRequest,
        user_id: &str,
    ) -> Result<AssetFetchResponse, FetchFailure> {
        let url = Url::parse(&fetch.source_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| {
                FetchFailure::new(ResolverError::Rejected(
                    "source URL must be an http(s) URL".to_string(),
                ))
            })?;

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchFailure::new(ResolverError::Rejected(format!("download failed: {err}"))))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure {
                attachment_id: None,
                status_code: Some(status.as_u16()),
                error: ResolverError::Rejected(format!("remote server returned {status}")),
            });
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|err| FetchFailure::new(ResolverError::Rejected(format!("download failed: {err}"))))?;

        let raw_name = remote_filename(&url);
        let mime = resolve_mime(&raw_name, &header_mime);
        let filename = with_extension(&raw_name, &mime);
        let key = self.object_key(user_id, &filename);
        let attachment_id = Uuid::new_v4().to_string();
        let with_id = |error: ResolverError| FetchFailure {
            attachment_id: Some(attachment_id.clone()),
            status_code: None,
            error,
        };

        let head = self
            .storage
            .put_object(&key, body, &mime)
            .await
            .map_err(|err| with_id(err.into()))?;
        let bucket = self.storage.bucket().to_string();
        let object_id = s3_object_id(&bucket, &key, head.version_id.as_deref());

        let record = AttachmentRecord {
            id: attachment_id.clone(),
            user_id: user_id.to_string(),
            conversation_id: fetch.conversation_id.clone(),
            message_id: fetch.message_id.clone(),
            filename,
            mime,
            size: head.size,
            bucket: bucket.clone(),
            key: key.clone(),
            version_id: head.version_id.clone(),
            s3_object_id: Some(object_id.clone()),
            etag: head.etag,
            origin: AssetOrigin::Remote,
            status: AssetStatus::Ready,
            source_url: Some(fetch.source_url.clone()),
        };
        self.conversations
            .create_attachment(&record)
            .await
            .map_err(|err| with_id(err.into()))?;

        let download_url = self
            .storage
            .presign_download(&key, head.version_id.as_deref(), self.presign_expiry())
            .await
            .map_err(|err| with_id(err.into()))?;
        info!(attachment_id = %attachment_id, size = head.size, "stored remote asset");

        Ok(AssetFetchResponse {
            conversation_id: fetch.conversation_id.clone(),
            attachment_id: attachment_id.clone(),
            source_url: fetch.source_url.clone(),
            success: true,
            bucket,
            key,
            version_id: head.version_id,
            s3_object_id: object_id,
            download_url,
            download_url_expires_at: self.download_expires_at(),
        })
    }
}
