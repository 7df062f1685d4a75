//! Supabase REST implementation of the delivery transport.

use crate::{AttachmentKind, DeliveryTransport, OutboundError, OutboundResult, ServerMessage};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Table that stores conversation messages.
pub const MESSAGES_TABLE: &str = "messages";
/// Storage bucket for message media.
pub const MEDIA_BUCKET: &str = "message-media";

/// Row inserted into the messages table.
#[derive(Debug, Serialize)]
struct NewMessageRow<'a> {
    conversation_id: &'a str,
    from_id: &'a str,
    message_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_id: Option<&'a str>,
}

impl<'a> NewMessageRow<'a> {
    fn new(
        conversation_id: &'a str,
        from_id: &'a str,
        message_type: &'static str,
        reply_to_id: Option<&'a str>,
    ) -> Self {
        Self {
            conversation_id,
            from_id,
            message_type,
            text: None,
            image_url: None,
            audio_url: None,
            audio_duration: None,
            latitude: None,
            longitude: None,
            location_name: None,
            reply_to_id,
        }
    }
}

/// Delivers messages through Supabase PostgREST and Storage.
///
/// The access token is read from a watch channel at request time so token
/// refreshes apply to the next attempt without rebuilding the transport.
#[derive(Clone)]
pub struct SupabaseDeliveryTransport {
    http_client: reqwest::Client,
    api_url: String,
    publishable_key: String,
    access_token: watch::Receiver<Option<String>>,
}

impl SupabaseDeliveryTransport {
    pub fn new(
        api_url: impl Into<String>,
        publishable_key: impl Into<String>,
        access_token: watch::Receiver<Option<String>>,
        request_timeout: Duration,
    ) -> OutboundResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let api_url = api_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            http_client,
            api_url,
            publishable_key: publishable_key.into(),
            access_token,
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    fn upload_url(&self, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.api_url, MEDIA_BUCKET, object_path
        )
    }

    fn public_url(&self, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.api_url, MEDIA_BUCKET, object_path
        )
    }

    fn bearer_token(&self) -> OutboundResult<String> {
        self.access_token
            .borrow()
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or(OutboundError::Unauthenticated)
    }

    async fn insert_message(&self, row: &NewMessageRow<'_>) -> OutboundResult<ServerMessage> {
        let token = self.bearer_token()?;

        debug!(
            conversation_id = row.conversation_id,
            message_type = row.message_type,
            "Inserting message"
        );

        let response = self
            .http_client
            .post(self.rest_url(MESSAGES_TABLE))
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;

        let response = check_response(response).await?;
        let mut rows: Vec<ServerMessage> = response.json().await?;
        if rows.is_empty() {
            return Err(OutboundError::Transport(
                "message insert returned no rows".to_string(),
            ));
        }
        Ok(rows.swap_remove(0))
    }
}

/// Storage object path for a new upload: `{conversation}/{uuid}.{ext}`.
fn object_path(conversation_id: &str, kind: AttachmentKind) -> String {
    format!(
        "{}/{}.{}",
        conversation_id,
        uuid::Uuid::new_v4(),
        kind.extension()
    )
}

async fn check_response(response: reqwest::Response) -> OutboundResult<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        warn!(status, "Supabase request failed");
        return Err(OutboundError::Backend { status, message });
    }
    Ok(response)
}

#[async_trait]
impl DeliveryTransport for SupabaseDeliveryTransport {
    async fn send_text(
        &self,
        conversation_id: &str,
        from_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        let mut row = NewMessageRow::new(conversation_id, from_id, "text", reply_to);
        row.text = Some(text);
        self.insert_message(&row).await
    }

    async fn send_image(
        &self,
        conversation_id: &str,
        from_id: &str,
        image_url: &str,
        caption: Option<&str>,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        let mut row = NewMessageRow::new(conversation_id, from_id, "image", reply_to);
        row.image_url = Some(image_url);
        row.text = caption;
        self.insert_message(&row).await
    }

    async fn send_audio(
        &self,
        conversation_id: &str,
        from_id: &str,
        audio_url: &str,
        duration_secs: f64,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        let mut row = NewMessageRow::new(conversation_id, from_id, "audio", reply_to);
        row.audio_url = Some(audio_url);
        row.audio_duration = Some(duration_secs);
        self.insert_message(&row).await
    }

    async fn send_location(
        &self,
        conversation_id: &str,
        from_id: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        let mut row = NewMessageRow::new(conversation_id, from_id, "location", reply_to);
        row.latitude = Some(latitude);
        row.longitude = Some(longitude);
        row.location_name = name;
        self.insert_message(&row).await
    }

    async fn upload_attachment(
        &self,
        bytes: Vec<u8>,
        conversation_id: &str,
        from_id: &str,
        kind: AttachmentKind,
    ) -> OutboundResult<String> {
        let token = self.bearer_token()?;
        let path = object_path(conversation_id, kind);

        debug!(
            conversation_id,
            from_id,
            bytes = bytes.len(),
            path = %path,
            "Uploading attachment"
        );

        let response = self
            .http_client
            .post(self.upload_url(&path))
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", kind.content_type())
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        check_response(response).await?;

        Ok(self.public_url(&path))
    }
}

impl std::fmt::Debug for SupabaseDeliveryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseDeliveryTransport")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
