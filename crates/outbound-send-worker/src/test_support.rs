//! In-memory collaborators for worker tests.

use crate::{
    AttachmentKind, DeliveryTransport, OutboundError, OutboundItem, OutboundResult,
    OutboundStore, ServerMessage,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Polls `condition` until it holds, advancing (paused) time in small steps.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, OutboundItem>>,
    confirmed: Mutex<Vec<(String, ServerMessage)>>,
    attachments: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryStore {
    pub fn seed(&self, item: OutboundItem) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<OutboundItem> {
        self.items.lock().unwrap().get(id).cloned()
    }

    pub fn confirmed_ids(&self) -> Vec<String> {
        self.confirmed
            .lock()
            .unwrap()
            .iter()
            .map(|(local_id, _)| local_id.clone())
            .collect()
    }

    pub fn add_attachment(&self, path: &Path, bytes: Vec<u8>) {
        self.attachments
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), bytes);
    }

    pub fn has_attachment(&self, path: &Path) -> bool {
        self.attachments.lock().unwrap().contains_key(path)
    }
}

#[async_trait]
impl OutboundStore for MemoryStore {
    async fn list_unresolved(&self) -> OutboundResult<Vec<OutboundItem>> {
        let mut items: Vec<OutboundItem> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.status.is_unresolved())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn get(&self, id: &str) -> OutboundResult<Option<OutboundItem>> {
        Ok(self.item(id))
    }

    async fn put(&self, item: &OutboundItem) -> OutboundResult<()> {
        self.seed(item.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> OutboundResult<()> {
        self.items.lock().unwrap().remove(id);
        Ok(())
    }

    async fn confirm_sent(&self, local_id: &str, message: &ServerMessage) -> OutboundResult<()> {
        self.items.lock().unwrap().remove(local_id);
        self.confirmed
            .lock()
            .unwrap()
            .push((local_id.to_string(), message.clone()));
        Ok(())
    }

    async fn load_attachment(&self, path: &Path) -> OutboundResult<Vec<u8>> {
        self.attachments
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| OutboundError::Store(format!("no attachment at {}", path.display())))
    }

    async fn delete_attachment(&self, path: &Path) -> OutboundResult<()> {
        self.attachments.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Transport double recording every send attempt.
#[derive(Default)]
pub struct FakeTransport {
    attempts: Mutex<Vec<(String, Instant)>>,
    uploads: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
    send_delay: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sequence: AtomicUsize,
}

impl FakeTransport {
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_conversation(&self, conversation_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(conversation_id.to_string());
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempts_for(&self, conversation_id: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(conversation, _)| conversation == conversation_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn attempted_conversations(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(conversation, _)| conversation.clone())
            .collect()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn record_send(
        &self,
        conversation_id: &str,
        from_id: &str,
        message_type: &str,
        text: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        self.attempts
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), Instant::now()));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fail_next = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_next
            || self.fail_all.load(Ordering::SeqCst)
            || self.failing.lock().unwrap().contains(conversation_id)
        {
            return Err(OutboundError::Transport("simulated outage".to_string()));
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(ServerMessage {
            id: format!("srv-{n}"),
            conversation_id: conversation_id.to_string(),
            from_id: from_id.to_string(),
            text: text.map(str::to_string),
            message_type: Some(message_type.to_string()),
            image_url: None,
            audio_url: None,
            audio_duration: None,
            latitude: None,
            longitude: None,
            location_name: None,
            reply_to_id: None,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl DeliveryTransport for FakeTransport {
    async fn send_text(
        &self,
        conversation_id: &str,
        from_id: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        self.record_send(conversation_id, from_id, "text", Some(text))
            .await
    }

    async fn send_image(
        &self,
        conversation_id: &str,
        from_id: &str,
        _image_url: &str,
        caption: Option<&str>,
        _reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        self.record_send(conversation_id, from_id, "image", caption)
            .await
    }

    async fn send_audio(
        &self,
        conversation_id: &str,
        from_id: &str,
        _audio_url: &str,
        _duration_secs: f64,
        _reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        self.record_send(conversation_id, from_id, "audio", None)
            .await
    }

    async fn send_location(
        &self,
        conversation_id: &str,
        from_id: &str,
        _latitude: f64,
        _longitude: f64,
        name: Option<&str>,
        _reply_to: Option<&str>,
    ) -> OutboundResult<ServerMessage> {
        self.record_send(conversation_id, from_id, "location", name)
            .await
    }

    async fn upload_attachment(
        &self,
        bytes: Vec<u8>,
        conversation_id: &str,
        _from_id: &str,
        kind: AttachmentKind,
    ) -> OutboundResult<String> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "https://cdn.test/{conversation_id}/{n}-{}.{}",
            bytes.len(),
            kind.extension()
        ))
    }
}
