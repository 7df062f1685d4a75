//! SQLite-backed `OutboundStore`.

use crate::{queries, AsyncDatabase, StoreResult};
use async_trait::async_trait;
use outbound_send_worker::{
    OutboundItem, OutboundResult, OutboundStatus, OutboundStore, ServerMessage,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable outbound queue: item rows in SQLite, attachment bytes as files
/// under `attachments_dir`.
#[derive(Clone)]
pub struct SqliteOutboundStore {
    db: AsyncDatabase,
    attachments_dir: PathBuf,
}

impl SqliteOutboundStore {
    pub async fn open(
        db_path: impl AsRef<Path>,
        attachments_dir: impl Into<PathBuf>,
    ) -> StoreResult<Self> {
        let db = AsyncDatabase::open(db_path.as_ref()).await?;
        Self::with_database(db, attachments_dir.into()).await
    }

    /// In-memory rows with attachments still on disk.
    pub async fn open_in_memory(attachments_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let db = AsyncDatabase::open_in_memory().await?;
        Self::with_database(db, attachments_dir.into()).await
    }

    async fn with_database(db: AsyncDatabase, attachments_dir: PathBuf) -> StoreResult<Self> {
        tokio::fs::create_dir_all(&attachments_dir).await?;
        Ok(Self {
            db,
            attachments_dir,
        })
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    pub fn attachments_dir(&self) -> &Path {
        &self.attachments_dir
    }

    /// Writes attachment bytes to a fresh file and returns its path, ready for
    /// `OutboundItem::with_attachment`.
    pub async fn stage_attachment(&self, bytes: &[u8], extension: &str) -> StoreResult<PathBuf> {
        let path = self
            .attachments_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Staged attachment");
        Ok(path)
    }

    /// Items the user may retry or discard.
    pub async fn list_failed(&self) -> StoreResult<Vec<OutboundItem>> {
        self.db
            .call(|conn| queries::list_items_by_status(conn, &[OutboundStatus::Failed]))
            .await
    }

    pub async fn confirmed_message(&self, local_id: &str) -> StoreResult<Option<ServerMessage>> {
        let local_id = local_id.to_string();
        self.db
            .call(move |conn| queries::get_confirmed_by_local_id(conn, &local_id))
            .await
    }

    pub async fn confirmed_messages(&self, conversation_id: &str) -> StoreResult<Vec<ServerMessage>> {
        let conversation_id = conversation_id.to_string();
        self.db
            .call(move |conn| queries::list_confirmed_for_conversation(conn, &conversation_id))
            .await
    }
}

#[async_trait]
impl OutboundStore for SqliteOutboundStore {
    async fn list_unresolved(&self) -> OutboundResult<Vec<OutboundItem>> {
        Ok(self
            .db
            .call(|conn| {
                queries::list_items_by_status(
                    conn,
                    &[OutboundStatus::Pending, OutboundStatus::Sending],
                )
            })
            .await?)
    }

    async fn get(&self, id: &str) -> OutboundResult<Option<OutboundItem>> {
        let id = id.to_string();
        Ok(self.db.call(move |conn| queries::get_item(conn, &id)).await?)
    }

    async fn put(&self, item: &OutboundItem) -> OutboundResult<()> {
        let item = item.clone();
        Ok(self
            .db
            .call(move |conn| queries::upsert_item(conn, &item))
            .await?)
    }

    async fn delete(&self, id: &str) -> OutboundResult<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| queries::delete_item(conn, &id))
            .await?;
        Ok(())
    }

    async fn confirm_sent(&self, local_id: &str, message: &ServerMessage) -> OutboundResult<()> {
        let local_id = local_id.to_string();
        let message = message.clone();
        Ok(self
            .db
            .call(move |conn| queries::confirm_sent(conn, &local_id, &message))
            .await?)
    }

    async fn load_attachment(&self, path: &Path) -> OutboundResult<Vec<u8>> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(crate::StoreError::from)?;
        Ok(bytes)
    }

    async fn delete_attachment(&self, path: &Path) -> OutboundResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete attachment");
                Err(crate::StoreError::from(e).into())
            }
        }
    }
}

impl std::fmt::Debug for SqliteOutboundStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteOutboundStore")
            .field("database", &self.db.path())
            .field("attachments_dir", &self.attachments_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbound_send_worker::MessagePayload;
    use tempfile::tempdir;

    fn text_item(conversation_id: &str, text: &str) -> OutboundItem {
        OutboundItem::new(
            conversation_id,
            "user-1",
            MessagePayload::Text {
                text: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn items_survive_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("outbox.sqlite");
        let attachments = dir.path().join("attachments");

        let item = text_item("conv-1", "see you at 5");
        {
            let store = SqliteOutboundStore::open(&db_path, &attachments)
                .await
                .unwrap();
            store.put(&item).await.unwrap();
        }

        let reopened = SqliteOutboundStore::open(&db_path, &attachments)
            .await
            .unwrap();
        let unresolved = reopened.list_unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, item.id);
        assert_eq!(unresolved[0].status, OutboundStatus::Pending);
    }

    #[tokio::test]
    async fn failed_items_are_not_unresolved() {
        let dir = tempdir().unwrap();
        let store = SqliteOutboundStore::open_in_memory(dir.path()).await.unwrap();

        let mut item = text_item("conv-1", "hi");
        item.status = OutboundStatus::Failed;
        item.last_error = Some("simulated outage".to_string());
        store.put(&item).await.unwrap();

        assert!(store.list_unresolved().await.unwrap().is_empty());
        let failed = store.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("simulated outage"));
    }

    #[tokio::test]
    async fn staged_attachment_loads_and_deletes() {
        let dir = tempdir().unwrap();
        let store = SqliteOutboundStore::open_in_memory(dir.path().join("media"))
            .await
            .unwrap();

        let path = store.stage_attachment(b"jpeg-bytes", "jpg").await.unwrap();
        assert!(path.starts_with(store.attachments_dir()));
        assert_eq!(store.load_attachment(&path).await.unwrap(), b"jpeg-bytes");

        store.delete_attachment(&path).await.unwrap();
        assert!(!path.exists());
        // Already gone: still fine.
        store.delete_attachment(&path).await.unwrap();
    }

    #[tokio::test]
    async fn missing_attachment_is_a_store_error() {
        let dir = tempdir().unwrap();
        let store = SqliteOutboundStore::open_in_memory(dir.path()).await.unwrap();
        let result = store.load_attachment(&dir.path().join("nope.jpg")).await;
        assert!(matches!(
            result,
            Err(outbound_send_worker::OutboundError::Store(_))
        ));
    }

    #[tokio::test]
    async fn confirm_sent_moves_item_to_confirmed() {
        let dir = tempdir().unwrap();
        let store = SqliteOutboundStore::open_in_memory(dir.path()).await.unwrap();
        let item = text_item("conv-7", "on my way");
        store.put(&item).await.unwrap();

        let message = ServerMessage {
            id: "srv-42".to_string(),
            conversation_id: "conv-7".to_string(),
            from_id: "user-1".to_string(),
            text: Some("on my way".to_string()),
            message_type: Some("text".to_string()),
            image_url: None,
            audio_url: None,
            audio_duration: None,
            latitude: None,
            longitude: None,
            location_name: None,
            reply_to_id: None,
            created_at: chrono::Utc::now(),
        };
        store.confirm_sent(&item.id, &message).await.unwrap();

        assert!(store.get(&item.id).await.unwrap().is_none());
        assert_eq!(
            store.confirmed_message(&item.id).await.unwrap(),
            Some(message)
        );
        assert_eq!(store.confirmed_messages("conv-7").await.unwrap().len(), 1);
    }
}
