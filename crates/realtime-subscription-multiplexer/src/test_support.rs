//! In-memory change feed for multiplexer tests.

use crate::{ChangeFeedTransport, ChangeKind, ChannelHandle, RealtimeError, RealtimeResult};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct FakeFeed {
    next_id: AtomicU64,
    opens: Mutex<HashMap<String, usize>>,
    unsubscribes: Mutex<HashMap<String, usize>>,
    listeners: Mutex<HashMap<(String, ChangeKind), mpsc::UnboundedSender<Value>>>,
    filters: Mutex<HashMap<String, Option<String>>>,
    failing: Mutex<HashSet<String>>,
    auth: Mutex<Option<String>>,
    disconnected: AtomicBool,
    connects: AtomicUsize,
}

impl FakeFeed {
    pub fn open_count(&self, channel: &str) -> usize {
        self.opens.lock().unwrap().get(channel).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().unwrap().values().sum()
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.unsubscribes
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn listener_kinds(&self, channel: &str) -> Vec<ChangeKind> {
        self.listeners
            .lock()
            .unwrap()
            .keys()
            .filter(|(name, _)| name == channel)
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub fn filter_for(&self, channel: &str) -> Option<String> {
        self.filters.lock().unwrap().get(channel).cloned().flatten()
    }

    /// Delivers a raw notification to the newest listener for `channel`/`kind`.
    pub fn push(&self, channel: &str, kind: ChangeKind, raw: Value) {
        let listeners = self.listeners.lock().unwrap();
        let sender = listeners
            .get(&(channel.to_string(), kind))
            .unwrap_or_else(|| panic!("no {kind} listener on {channel}"));
        sender.send(raw).unwrap();
    }

    pub fn fail_subscribe(&self, channel: &str) {
        self.failing.lock().unwrap().insert(channel.to_string());
    }

    pub fn allow_subscribe(&self, channel: &str) {
        self.failing.lock().unwrap().remove(channel);
    }

    pub fn last_auth(&self) -> Option<String> {
        self.auth.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeedTransport for FakeFeed {
    async fn open_channel(&self, name: &str) -> RealtimeResult<ChannelHandle> {
        *self.opens.lock().unwrap().entry(name.to_string()).or_default() += 1;
        self.listeners
            .lock()
            .unwrap()
            .retain(|(channel, _), _| channel != name);
        Ok(ChannelHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
        })
    }

    async fn add_change_listener(
        &self,
        channel: &ChannelHandle,
        _table: &str,
        filter: Option<&str>,
        kind: ChangeKind,
    ) -> RealtimeResult<BoxStream<'static, Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap()
            .insert((channel.name.clone(), kind), tx);
        self.filters
            .lock()
            .unwrap()
            .insert(channel.name.clone(), filter.map(str::to_string));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }

    async fn subscribe(&self, channel: &ChannelHandle) -> RealtimeResult<()> {
        if self.failing.lock().unwrap().contains(&channel.name) {
            return Err(RealtimeError::Transport("channel error".to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelHandle) {
        *self
            .unsubscribes
            .lock()
            .unwrap()
            .entry(channel.name.clone())
            .or_default() += 1;
    }

    async fn set_auth(&self, token: Option<&str>) {
        *self.auth.lock().unwrap() = token.map(str::to_string);
    }

    async fn connect(&self) -> RealtimeResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}
