use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where an attachment came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetOrigin {
    Upload,
    Generated,
    Remote,
    Pasted,
    Import,
    Scraped,
    Screenshot,
}

impl AssetOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Generated => "GENERATED",
            Self::Remote => "REMOTE",
            Self::Pasted => "PASTED",
            Self::Import => "IMPORT",
            Self::Scraped => "SCRAPED",
            Self::Screenshot => "SCREENSHOT",
        }
    }
}

impl TryFrom<&str> for AssetOrigin {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "UPLOAD" => Ok(Self::Upload),
            "GENERATED" => Ok(Self::Generated),
            "REMOTE" => Ok(Self::Remote),
            "PASTED" => Ok(Self::Pasted),
            "IMPORT" => Ok(Self::Import),
            "SCRAPED" => Ok(Self::Scraped),
            "SCREENSHOT" => Ok(Self::Screenshot),
            _ => Err("invalid asset origin"),
        }
    }
}

/// Attachment lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Requested,
    Uploading,
    Stored,
    Ready,
    Failed,
    Attached,
    Deleted,
}

impl AssetStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Uploading => "UPLOADING",
            Self::Stored => "STORED",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
            Self::Attached => "ATTACHED",
            Self::Deleted => "DELETED",
        }
    }
}

impl TryFrom<&str> for AssetStatus {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "REQUESTED" => Ok(Self::Requested),
            "UPLOADING" => Ok(Self::Uploading),
            "STORED" => Ok(Self::Stored),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            "ATTACHED" => Ok(Self::Attached),
            "DELETED" => Ok(Self::Deleted),
            _ => Err("invalid asset status"),
        }
    }
}

/// Canonical object identity, `s3://bucket/key#version` (`nov` when unversioned).
#[must_use]
pub fn s3_object_id(bucket: &str, key: &str, version_id: Option<&str>) -> String {
    format!("s3://{bucket}/{key}#{}", version_id.unwrap_or("nov"))
}

/// Client announces a pasted blob it wants to upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetPaste {
    pub conversation_id: String,
    pub filename: String,
    #[serde(default)]
    pub mime: String,
    pub size: u64,
}

/// Client announces a file picked for attachment to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetAttached {
    pub conversation_id: String,
    pub filename: String,
    #[serde(default)]
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Client asks the server to download and store a remote file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetFetchRequest {
    pub conversation_id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Client reports that its presigned upload finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadComplete {
    pub conversation_id: String,
    pub attachment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_object_id: Option<String>,
}

/// Upload progress, sent by clients and republished to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadProgress {
    pub conversation_id: String,
    pub attachment_id: String,
    /// Percentage, 0 to 100.
    pub progress: u8,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
}

/// Where and how the client should PUT its bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadInstructions {
    pub conversation_id: String,
    pub attachment_id: String,
    pub method: String,
    pub upload_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub required_headers: BTreeMap<String, String>,
    /// Seconds until the upload URL expires.
    pub expires_in: u64,
    pub bucket: String,
    pub key: String,
}

/// Attachment verified in storage and usable in chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetReady {
    pub conversation_id: String,
    pub attachment_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub s3_object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub size: u64,
    pub mime: String,
    pub origin: AssetOrigin,
    pub status: AssetStatus,
    pub download_url: String,
    /// Epoch milliseconds.
    pub download_url_expires_at: i64,
}

/// Failure in the paste, attach, or finalize path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetUploadError {
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Remote file fetched and stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetFetchResponse {
    pub conversation_id: String,
    pub attachment_id: String,
    pub source_url: String,
    pub success: bool,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub s3_object_id: String,
    pub download_url: String,
    /// Epoch milliseconds.
    pub download_url_expires_at: i64,
}

/// Remote fetch failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetFetchError {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_marks_unversioned_objects() {
        assert_eq!(
            s3_object_id("assets", "user-assets/u1/1_paste.png", None),
            "s3://assets/user-assets/u1/1_paste.png#nov"
        );
        assert_eq!(s3_object_id("b", "k", Some("v3")), "s3://b/k#v3");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [AssetStatus::Requested, AssetStatus::Ready, AssetStatus::Failed] {
            assert_eq!(AssetStatus::try_from(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn paste_accepts_missing_mime() {
        let paste: AssetPaste = serde_json::from_str(
            r#"{"conversationId":"c1","filename":"paste.png","size":12}"#,
        )
        .unwrap();
        assert!(paste.mime.is_empty());
    }
}
