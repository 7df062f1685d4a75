//! Outbound queue data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Delivery status of an outbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboundStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string; unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending and sending items still need a drain pass.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::Sending)
    }
}

impl fmt::Display for OutboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media carried by a local attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Audio,
}

impl AttachmentKind {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "m4a",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Image => "image/jpeg",
            Self::Audio => "audio/mp4",
        }
    }
}

/// What an outbound message carries.
///
/// Media variants hold the remote URL once the attachment has been uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    Audio {
        #[serde(default)]
        url: Option<String>,
        duration_secs: f64,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        name: Option<String>,
    },
}

impl MessagePayload {
    /// Backend `message_type` column value.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Audio { .. } => "audio",
            Self::Location { .. } => "location",
        }
    }

    pub fn attachment_kind(&self) -> Option<AttachmentKind> {
        match self {
            Self::Image { .. } => Some(AttachmentKind::Image),
            Self::Audio { .. } => Some(AttachmentKind::Audio),
            Self::Text { .. } | Self::Location { .. } => None,
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match self {
            Self::Image { url, .. } | Self::Audio { url, .. } => url.as_deref(),
            Self::Text { .. } | Self::Location { .. } => None,
        }
    }

    /// Records the uploaded URL on a media payload. No-op for text and location.
    pub fn set_media_url(&mut self, remote: String) {
        match self {
            Self::Image { url, .. } | Self::Audio { url, .. } => *url = Some(remote),
            Self::Text { .. } | Self::Location { .. } => {}
        }
    }
}

/// One message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundItem {
    /// Locally generated id, stable across retries.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub payload: MessagePayload,
    /// Media staged on disk that has not been uploaded yet.
    pub local_attachment_path: Option<PathBuf>,
    pub reply_to_id: Option<String>,
    pub status: OutboundStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundItem {
    /// Creates a pending item with a fresh id.
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            payload,
            local_attachment_path: None,
            reply_to_id: None,
            status: OutboundStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_attachment_path = Some(path.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(reply_to_id.into());
        self
    }

    /// True when a staged attachment still has to be uploaded before sending.
    pub fn needs_upload(&self) -> bool {
        self.local_attachment_path.is_some()
            && self.payload.attachment_kind().is_some()
            && self.payload.media_url().is_none()
    }

    pub(crate) fn transition(&mut self, status: OutboundStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Authoritative message row returned by the backend after a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: String,
    pub conversation_id: String,
    pub from_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub audio_duration: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
