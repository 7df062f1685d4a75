//! Channel table owner task and the cloneable handle that talks to it.

use crate::policy::{auth_fingerprint, choose_victim, is_protected, EvictionCandidate};
use crate::{decode_change, ChangeEvent, ChangeFeedTransport, ChangeKind, ChannelHandle};
use crate::{RealtimeError, RealtimeResult};
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cap on simultaneously open channels.
pub const DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS: usize = 30;
/// Default delay between backgrounding and teardown.
pub const DEFAULT_BACKGROUND_GRACE_PERIOD: Duration = Duration::from_secs(30);

const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub max_concurrent_subscriptions: usize,
    pub background_grace_period: Duration,
    /// Channel-name prefixes evicted only when nothing else can be.
    pub protected_prefixes: Vec<String>,
    /// Per-channel broadcast buffer; slow receivers past it see `Lagged`.
    pub event_buffer: usize,
    pub command_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscriptions: DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS,
            background_grace_period: DEFAULT_BACKGROUND_GRACE_PERIOD,
            protected_prefixes: vec![
                "messages:".to_string(),
                "conversations:".to_string(),
                "dashboard:".to_string(),
            ],
            event_buffer: DEFAULT_EVENT_BUFFER,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// App lifecycle transitions the multiplexer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteredBackground,
    WillEnterForeground,
    DidBecomeActive,
}

/// What to listen to on a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel: String,
    pub table: String,
    /// Backend filter expression, e.g. `conversation_id=eq.42`.
    pub filter: Option<String>,
    pub kinds: Vec<ChangeKind>,
}

impl SubscriptionRequest {
    /// Listens to every change kind on `table` without a filter.
    pub fn new(channel: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            table: table.into(),
            filter: None,
            kinds: ChangeKind::ALL.to_vec(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_kinds(mut self, kinds: &[ChangeKind]) -> Self {
        let mut unique = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(kind) {
                unique.push(*kind);
            }
        }
        self.kinds = unique;
        self
    }
}

/// Diagnostic view of one open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub table: String,
    pub subscribed_at: DateTime<Utc>,
    /// Monotonic open counter; a reopened channel gets a new value.
    pub open_sequence: u64,
    pub protected: bool,
    pub auth_fingerprint: String,
}

enum Command {
    Subscribe {
        request: SubscriptionRequest,
        reply: oneshot::Sender<broadcast::Receiver<ChangeEvent>>,
    },
    Unsubscribe {
        channel: String,
        retain: bool,
        reply: oneshot::Sender<()>,
    },
    UnsubscribeAll {
        retain: bool,
        reply: oneshot::Sender<()>,
    },
    Lifecycle {
        event: LifecycleEvent,
        reply: oneshot::Sender<()>,
    },
    OpenChannels {
        reply: oneshot::Sender<Vec<ChannelInfo>>,
    },
    RetainedChannels {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the subscription multiplexer.
#[derive(Clone)]
pub struct RealtimeMultiplexer {
    commands: mpsc::Sender<Command>,
}

impl RealtimeMultiplexer {
    /// Spawns the owner task.
    ///
    /// `access_token` carries the current credential; every change
    /// re-authenticates the transport and reopens tracked channels.
    pub fn start(
        config: MultiplexerConfig,
        transport: Arc<dyn ChangeFeedTransport>,
        access_token: watch::Receiver<Option<String>>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_capacity.max(1));
        let owner = Owner {
            capacity: config.max_concurrent_subscriptions.max(1),
            config,
            transport,
            access_token,
            fingerprint: None,
            configs: HashMap::new(),
            open: HashMap::new(),
            next_sequence: 0,
            next_registration: 0,
            grace_deadline: None,
            suspended: false,
        };
        tokio::spawn(owner.run(receiver));
        Self { commands }
    }

    /// Records the channel configuration and opens it if needed.
    ///
    /// Idempotent per channel name. Every receiver for a name shares one
    /// event stream that survives reopening; it closes once the
    /// configuration is forgotten (unsubscribe without retain, eviction).
    /// Open failures are logged, not returned.
    ///
    /// Events are not replayed. A receiver more than
    /// [`MultiplexerConfig::event_buffer`] events behind loses the oldest
    /// ones: its next `recv` returns `RecvError::Lagged(n)` with the number
    /// skipped, and after that it continues with the oldest event still
    /// buffered. Callers that must not miss a change should refetch on
    /// `Lagged`.
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> RealtimeResult<broadcast::Receiver<ChangeEvent>> {
        self.request(|reply| Command::Subscribe { request, reply })
            .await
    }

    pub async fn unsubscribe(&self, channel: impl Into<String>, retain: bool) -> RealtimeResult<()> {
        let channel = channel.into();
        self.request(|reply| Command::Unsubscribe {
            channel,
            retain,
            reply,
        })
        .await
    }

    /// Closes every channel. `retain` keeps configurations for a later
    /// foreground restore; pass `false` on logout.
    pub async fn unsubscribe_all(&self, retain: bool) -> RealtimeResult<()> {
        self.request(|reply| Command::UnsubscribeAll { retain, reply })
            .await
    }

    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> RealtimeResult<()> {
        self.request(|reply| Command::Lifecycle { event, reply })
            .await
    }

    /// Open channels ordered by open sequence.
    pub async fn open_channels(&self) -> RealtimeResult<Vec<ChannelInfo>> {
        self.request(|reply| Command::OpenChannels { reply }).await
    }

    /// Names of retained configurations, sorted.
    pub async fn retained_channels(&self) -> RealtimeResult<Vec<String>> {
        self.request(|reply| Command::RetainedChannels { reply })
            .await
    }

    /// Closes every channel, forgets all configurations and stops the owner.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> RealtimeResult<T> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RealtimeError::Stopped)?;
        receiver.await.map_err(|_| RealtimeError::Stopped)
    }
}

/// Retained configuration; outlives the open channel.
struct ChannelConfig {
    table: String,
    filter: Option<String>,
    kinds: Vec<ChangeKind>,
    events: broadcast::Sender<ChangeEvent>,
    registration: u64,
}

impl ChannelConfig {
    fn targets(&self, request: &SubscriptionRequest) -> bool {
        self.table == request.table && self.filter == request.filter && self.kinds == request.kinds
    }
}

struct OpenChannel {
    handle: ChannelHandle,
    table: String,
    subscribed_at: DateTime<Utc>,
    sequence: u64,
    listeners: CancellationToken,
    auth_fingerprint: String,
    protected: bool,
}

struct Owner {
    config: MultiplexerConfig,
    capacity: usize,
    transport: Arc<dyn ChangeFeedTransport>,
    access_token: watch::Receiver<Option<String>>,
    /// Fingerprint last applied to the transport; `None` before the first sync.
    fingerprint: Option<String>,
    configs: HashMap<String, ChannelConfig>,
    open: HashMap<String, OpenChannel>,
    next_sequence: u64,
    next_registration: u64,
    grace_deadline: Option<Instant>,
    /// Channels were torn down by the grace timer and await a foreground.
    suspended: bool,
}

impl Owner {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            capacity = self.capacity,
            grace_secs = self.config.background_grace_period.as_secs(),
            "Realtime multiplexer started"
        );
        self.sync_auth().await;

        let mut auth_open = true;
        loop {
            let deadline = self.grace_deadline;
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Some(reply) = self.handle(command).await {
                        self.close_all(false).await;
                        let _ = reply.send(());
                        info!("Realtime multiplexer stopped");
                        return;
                    }
                }
                changed = self.access_token.changed(), if auth_open => {
                    if changed.is_err() {
                        debug!("Auth source closed; keeping last credential");
                        auth_open = false;
                        continue;
                    }
                    self.sync_auth().await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.grace_deadline = None;
                    self.on_grace_expired().await;
                }
            }
        }

        self.close_all(false).await;
        debug!("All multiplexer handles dropped");
    }

    /// Returns the reply sender when the command asks the owner to stop.
    async fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Subscribe { request, reply } => {
                let receiver = self.subscribe(request).await;
                let _ = reply.send(receiver);
            }
            Command::Unsubscribe {
                channel,
                retain,
                reply,
            } => {
                self.close_channel(&channel).await;
                if !retain && self.configs.remove(&channel).is_some() {
                    debug!(channel = %channel, "Forgot channel configuration");
                }
                let _ = reply.send(());
            }
            Command::UnsubscribeAll { retain, reply } => {
                self.close_all(retain).await;
                let _ = reply.send(());
            }
            Command::Lifecycle { event, reply } => {
                self.on_lifecycle(event).await;
                let _ = reply.send(());
            }
            Command::OpenChannels { reply } => {
                let _ = reply.send(self.channel_infos());
            }
            Command::RetainedChannels { reply } => {
                let mut names: Vec<String> = self.configs.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn subscribe(&mut self, request: SubscriptionRequest) -> broadcast::Receiver<ChangeEvent> {
        self.sync_auth().await;
        let name = request.channel.clone();

        let (receiver, retargeted) = match self.configs.get_mut(&name) {
            Some(existing) => {
                let retargeted = !existing.targets(&request);
                if retargeted {
                    existing.table = request.table;
                    existing.filter = request.filter;
                    existing.kinds = request.kinds;
                }
                (existing.events.subscribe(), retargeted)
            }
            None => {
                let (events, receiver) = broadcast::channel(self.config.event_buffer.max(1));
                self.next_registration += 1;
                self.configs.insert(
                    name.clone(),
                    ChannelConfig {
                        table: request.table,
                        filter: request.filter,
                        kinds: request.kinds,
                        events,
                        registration: self.next_registration,
                    },
                );
                (receiver, false)
            }
        };

        if let Some(open) = self.open.get(&name) {
            let current = self.fingerprint.as_deref().unwrap_or_default();
            if !retargeted && open.auth_fingerprint == current {
                debug!(channel = %name, "Channel already open");
                return receiver;
            }
            info!(channel = %name, retargeted, "Reopening channel");
            self.close_channel(&name).await;
        }

        self.open_channel(&name).await;
        receiver
    }

    /// Applies the current access token to the transport when its
    /// fingerprint changed, then reopens tracked channels.
    async fn sync_auth(&mut self) {
        let token = self.access_token.borrow_and_update().clone();
        let fingerprint = auth_fingerprint(token.as_deref());
        if self.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return;
        }

        let first = self.fingerprint.is_none();
        self.fingerprint = Some(fingerprint.clone());
        self.transport.set_auth(token.as_deref()).await;
        info!(auth = %fingerprint, "Realtime credential applied");

        if first || self.suspended || self.configs.is_empty() {
            return;
        }
        self.resubscribe_all("auth changed").await;
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::EnteredBackground => {
                if self.grace_deadline.is_none() && !self.suspended {
                    self.grace_deadline =
                        Some(Instant::now() + self.config.background_grace_period);
                    info!(
                        open = self.open.len(),
                        grace_secs = self.config.background_grace_period.as_secs(),
                        "Background grace period started"
                    );
                }
            }
            LifecycleEvent::WillEnterForeground | LifecycleEvent::DidBecomeActive => {
                if self.grace_deadline.take().is_some() {
                    info!(open = self.open.len(), "Background grace period cancelled");
                }
                self.suspended = false;

                let in_sync = self.configs.len() == self.open.len()
                    && self.configs.keys().all(|name| self.open.contains_key(name));
                if !in_sync || !self.transport.is_connected() {
                    self.resubscribe_all("foreground").await;
                }
            }
        }
    }

    async fn on_grace_expired(&mut self) {
        info!(
            open = self.open.len(),
            retained = self.configs.len(),
            "Background grace period expired; closing channels"
        );
        self.close_all(true).await;
        self.suspended = true;
    }

    /// Closes every open channel and reopens every retained configuration
    /// in registration order.
    async fn resubscribe_all(&mut self, reason: &str) {
        info!(reason, retained = self.configs.len(), "Resubscribing channels");

        if !self.transport.is_connected() {
            if let Err(e) = self.transport.connect().await {
                warn!(error = %e, "Realtime connect failed");
            }
        }

        let names: Vec<String> = self.open.keys().cloned().collect();
        for name in names {
            self.close_channel(&name).await;
        }

        let mut retained: Vec<(u64, String)> = self
            .configs
            .iter()
            .map(|(name, config)| (config.registration, name.clone()))
            .collect();
        retained.sort();
        for (_, name) in retained {
            if self.configs.contains_key(&name) {
                self.open_channel(&name).await;
            }
        }
    }

    async fn open_channel(&mut self, name: &str) {
        let Some(config) = self.configs.get(name) else {
            return;
        };
        let table = config.table.clone();
        let filter = config.filter.clone();
        let kinds = config.kinds.clone();
        let events = config.events.clone();

        if self.open.len() >= self.capacity {
            self.evict_one().await;
        }

        let handle = match self.transport.open_channel(name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(channel = %name, error = %e, "Failed to open channel");
                return;
            }
        };

        let mut streams: Vec<(ChangeKind, BoxStream<'static, Value>)> =
            Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self
                .transport
                .add_change_listener(&handle, &table, filter.as_deref(), kind)
                .await
            {
                Ok(stream) => streams.push((kind, stream)),
                Err(e) => {
                    warn!(channel = %name, kind = %kind, error = %e, "Failed to attach listener");
                    self.transport.unsubscribe(&handle).await;
                    return;
                }
            }
        }

        if let Err(e) = self.transport.subscribe(&handle).await {
            warn!(channel = %name, error = %e, "Subscribe failed; channel left closed");
            self.transport.unsubscribe(&handle).await;
            return;
        }

        let listeners = CancellationToken::new();
        for (kind, stream) in streams {
            tokio::spawn(listen(
                name.to_string(),
                table.clone(),
                kind,
                stream,
                events.clone(),
                listeners.clone(),
            ));
        }

        self.next_sequence += 1;
        let protected = is_protected(name, &self.config.protected_prefixes);
        let auth_fingerprint = self.fingerprint.clone().unwrap_or_default();
        info!(
            channel = %name,
            table = %table,
            protected,
            sequence = self.next_sequence,
            auth = %auth_fingerprint,
            "Channel opened"
        );
        self.open.insert(
            name.to_string(),
            OpenChannel {
                handle,
                table,
                subscribed_at: Utc::now(),
                sequence: self.next_sequence,
                listeners,
                auth_fingerprint,
                protected,
            },
        );
    }

    /// Closes the eviction victim and forgets its configuration, which
    /// closes its subscribers' event streams.
    async fn evict_one(&mut self) {
        let victim = choose_victim(self.open.iter().map(|(name, open)| EvictionCandidate {
            name: name.as_str(),
            protected: open.protected,
            sequence: open.sequence,
        }))
        .map(str::to_string);

        if let Some(victim) = victim {
            info!(channel = %victim, open = self.open.len(), "Evicting channel at capacity");
            self.close_channel(&victim).await;
            self.configs.remove(&victim);
        }
    }

    async fn close_channel(&mut self, name: &str) -> bool {
        let Some(open) = self.open.remove(name) else {
            return false;
        };
        open.listeners.cancel();
        self.transport.unsubscribe(&open.handle).await;
        debug!(channel = %name, sequence = open.sequence, "Channel closed");
        true
    }

    async fn close_all(&mut self, retain: bool) {
        let names: Vec<String> = self.open.keys().cloned().collect();
        for name in &names {
            self.close_channel(name).await;
        }
        if !retain {
            self.configs.clear();
            self.grace_deadline = None;
            self.suspended = false;
        }
        info!(closed = names.len(), retain, "Closed all channels");
    }

    fn channel_infos(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .open
            .iter()
            .map(|(name, open)| ChannelInfo {
                name: name.clone(),
                table: open.table.clone(),
                subscribed_at: open.subscribed_at,
                open_sequence: open.sequence,
                protected: open.protected,
                auth_fingerprint: open.auth_fingerprint.clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.open_sequence);
        infos
    }
}

/// Forwards decoded events for one change kind until cancelled or the
/// transport ends the stream.
async fn listen(
    channel: String,
    table: String,
    kind: ChangeKind,
    mut stream: BoxStream<'static, Value>,
    events: broadcast::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(raw) => raw,
                None => {
                    debug!(channel = %channel, kind = %kind, "Change stream ended");
                    break;
                }
            },
        };

        match decode_change(&table, kind, &raw) {
            Ok(event) => {
                debug!(channel = %channel, kind = %event.kind, "Change event");
                // No receivers is fine; the configuration still wants the channel.
                let _ = events.send(event);
            }
            Err(e) => {
                warn!(channel = %channel, kind = %kind, error = %e, "Dropping undecodable change event");
            }
        }
    }
}
