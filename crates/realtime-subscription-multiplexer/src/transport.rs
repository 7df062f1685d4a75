//! Change-feed transport collaborator.

use crate::{ChangeKind, RealtimeResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Transport-issued reference to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub name: String,
}

/// Live change-feed backend (e.g. Supabase Realtime).
///
/// Listeners are attached before `subscribe`; each listener yields raw
/// notifications for one event kind until the channel is unsubscribed.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    async fn open_channel(&self, name: &str) -> RealtimeResult<ChannelHandle>;

    async fn add_change_listener(
        &self,
        channel: &ChannelHandle,
        table: &str,
        filter: Option<&str>,
        kind: ChangeKind,
    ) -> RealtimeResult<BoxStream<'static, Value>>;

    async fn subscribe(&self, channel: &ChannelHandle) -> RealtimeResult<()>;

    /// Best effort; the channel is considered gone afterwards either way.
    async fn unsubscribe(&self, channel: &ChannelHandle);

    async fn set_auth(&self, token: Option<&str>);

    async fn connect(&self) -> RealtimeResult<()>;

    fn is_connected(&self) -> bool;
}
