//! Durable record store collaborator.

use crate::{OutboundItem, OutboundResult, ServerMessage};
use async_trait::async_trait;
use std::path::Path;

/// Local durable storage for outbound items and their staged attachments.
///
/// Only the send worker writes through this trait.
#[async_trait]
pub trait OutboundStore: Send + Sync {
    /// Items that are `pending` or `sending`, oldest first.
    async fn list_unresolved(&self) -> OutboundResult<Vec<OutboundItem>>;

    async fn get(&self, id: &str) -> OutboundResult<Option<OutboundItem>>;

    /// Inserts or replaces the item with the same id.
    async fn put(&self, item: &OutboundItem) -> OutboundResult<()>;

    async fn delete(&self, id: &str) -> OutboundResult<()>;

    /// Replaces the optimistic item with the server-confirmed message.
    async fn confirm_sent(&self, local_id: &str, message: &ServerMessage) -> OutboundResult<()>;

    async fn load_attachment(&self, path: &Path) -> OutboundResult<Vec<u8>>;

    /// Removes a staged attachment. Missing files are not an error.
    async fn delete_attachment(&self, path: &Path) -> OutboundResult<()>;
}
