//! Delivery transport collaborator.

use crate::{AttachmentKind, OutboundResult, ServerMessage};
use async_trait::async_trait;

/// Network side of message delivery.
///
/// Every call is a single attempt; retries are the worker's job.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send_text(
        &self,
        conversation_id: &str,
        from_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage>;

    async fn send_image(
        &self,
        conversation_id: &str,
        from_id: &str,
        image_url: &str,
        caption: Option<&str>,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage>;

    async fn send_audio(
        &self,
        conversation_id: &str,
        from_id: &str,
        audio_url: &str,
        duration_secs: f64,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage>;

    async fn send_location(
        &self,
        conversation_id: &str,
        from_id: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
        reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage>;

    /// Uploads staged media and returns its public URL.
    async fn upload_attachment(
        &self,
        bytes: Vec<u8>,
        conversation_id: &str,
        from_id: &str,
        kind: AttachmentKind,
    ) -> OutboundResult<String>;
}
