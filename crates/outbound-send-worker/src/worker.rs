//! Send worker owner task and drain pass.
//!
//! One owner task holds the worker state. It starts at most one drain pass at
//! a time; a restart request cancels the running pass and the replacement is
//! only spawned after the old pass has exited, so no item ever sees two
//! concurrent attempts.
//!
//! Attempts used and the next retry instant of each item live in a retry
//! ledger that is handed to every pass and handed back when it ends. A
//! restarted pass resumes an item's backoff instead of starting it over, and
//! items still waiting out a backoff go to the back of the pass.

use crate::{
    BackoffPolicy, DeliveryTransport, MessagePayload, OutboundError, OutboundItem,
    OutboundResult, OutboundStatus, OutboundStore, ServerMessage,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default capacity of the worker command queue.
const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Send worker configuration.
#[derive(Debug, Clone)]
pub struct SendWorkerConfig {
    /// Attempt budget and retry timing per item.
    pub backoff: BackoffPolicy,
    /// Capacity of the handle-to-owner command queue.
    pub command_capacity: usize,
}

impl Default for SendWorkerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// Point-in-time view of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub pass_running: bool,
    pub reachable: bool,
    /// Item the running pass is currently delivering.
    pub current_item_id: Option<String>,
}

enum Command {
    Notify,
    Enqueue {
        item: OutboundItem,
        reply: oneshot::Sender<OutboundResult<()>>,
    },
    RetryFailed {
        id: String,
        reply: oneshot::Sender<OutboundResult<()>>,
    },
    DiscardFailed {
        id: String,
        reply: oneshot::Sender<OutboundResult<()>>,
    },
    Status {
        reply: oneshot::Sender<WorkerStatus>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running send worker.
#[derive(Clone)]
pub struct SendWorkerHandle {
    commands: mpsc::Sender<Command>,
}

impl SendWorkerHandle {
    /// Signals that a new item is pending. Restarts the drain pass.
    ///
    /// Never blocks; a full command queue already guarantees a pass.
    pub fn notify_new_pending_message(&self) {
        match self.commands.try_send(Command::Notify) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Send worker queue full; notify coalesced"),
            Err(TrySendError::Closed(_)) => debug!("Send worker stopped; notify dropped"),
        }
    }

    /// Persists `item` as pending and triggers a drain pass.
    pub async fn enqueue(&self, item: OutboundItem) -> OutboundResult<()> {
        self.request(|reply| Command::Enqueue { item, reply }).await?
    }

    /// Moves a failed item back to pending and triggers a drain pass.
    pub async fn retry_failed(&self, id: impl Into<String>) -> OutboundResult<()> {
        let id = id.into();
        self.request(|reply| Command::RetryFailed { id, reply }).await?
    }

    /// Removes a failed item together with its staged attachment.
    pub async fn discard_failed(&self, id: impl Into<String>) -> OutboundResult<()> {
        let id = id.into();
        self.request(|reply| Command::DiscardFailed { id, reply })
            .await?
    }

    pub async fn status(&self) -> OutboundResult<WorkerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stops the worker and waits for the running pass to exit.
    ///
    /// An item already marked `sending` stays that way and is picked up again
    /// on the next start.
    pub async fn stop(&self) {
        let _ = self.request(|reply| Command::Stop { reply }).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> OutboundResult<R> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| OutboundError::WorkerStopped)?;
        receiver.await.map_err(|_| OutboundError::WorkerStopped)
    }
}

/// Durable send worker.
///
/// Drives every unresolved outbound item to `sent` or `failed`.
pub struct SendWorker {
    config: SendWorkerConfig,
    store: Arc<dyn OutboundStore>,
    transport: Arc<dyn DeliveryTransport>,
}

impl SendWorker {
    pub fn new(
        config: SendWorkerConfig,
        store: Arc<dyn OutboundStore>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
        }
    }

    /// Spawns the owner task and immediately starts a drain pass.
    ///
    /// `reachability` carries the current network state; a false to true
    /// transition starts a fresh pass.
    pub fn start(self, reachability: watch::Receiver<bool>) -> SendWorkerHandle {
        let (commands, receiver) = mpsc::channel(self.config.command_capacity.max(1));
        let (current_item, _) = watch::channel(None);
        let reachable = *reachability.borrow();

        let owner = Owner {
            store: self.store,
            transport: self.transport,
            policy: self.config.backoff,
            reachability,
            reachable,
            running: None,
            rerun_requested: false,
            retries: RetryLedger::new(),
            current_item: Arc::new(current_item),
        };
        tokio::spawn(owner.run(receiver));

        SendWorkerHandle { commands }
    }
}

struct RunningPass {
    cancel: CancellationToken,
    task: JoinHandle<(PassSummary, RetryLedger)>,
}

#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_attempt_at: Instant,
    last_error: Option<String>,
}

impl RetryState {
    fn fresh() -> Self {
        Self {
            attempts: 0,
            next_attempt_at: Instant::now(),
            last_error: None,
        }
    }
}

/// Retry progress of unresolved items, keyed by item id.
type RetryLedger = HashMap<String, RetryState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    Drained,
    Offline,
    Cancelled,
    StoreUnavailable,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct PassSummary {
    sent: usize,
    failed: usize,
    end: PassEnd,
}

enum Flow {
    Continue,
    Stop(oneshot::Sender<()>),
}

struct Owner {
    store: Arc<dyn OutboundStore>,
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    reachability: watch::Receiver<bool>,
    reachable: bool,
    running: Option<RunningPass>,
    rerun_requested: bool,
    /// Empty while a pass owns it.
    retries: RetryLedger,
    current_item: Arc<watch::Sender<Option<String>>>,
}

impl Owner {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(reachable = self.reachable, "Send worker started");
        self.request_pass("start");

        let mut reachability_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if let Flow::Stop(reply) = self.handle(command).await {
                        self.shutdown().await;
                        let _ = reply.send(());
                        info!("Send worker stopped");
                        return;
                    }
                }
                changed = self.reachability.changed(), if reachability_open => {
                    if changed.is_err() {
                        debug!("Reachability source closed; keeping last known state");
                        reachability_open = false;
                        continue;
                    }
                    let reachable = *self.reachability.borrow_and_update();
                    self.on_reachability(reachable);
                }
                (summary, retries) = join_pass(&mut self.running) => {
                    self.running = None;
                    self.retries = retries;
                    self.current_item.send_replace(None);
                    info!(
                        sent = summary.sent,
                        failed = summary.failed,
                        end = ?summary.end,
                        "Drain pass finished"
                    );
                    if std::mem::take(&mut self.rerun_requested) {
                        self.start_pass("restart");
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Send worker stopped (all handles dropped)");
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Notify => self.request_pass("notify"),
            Command::Enqueue { item, reply } => {
                let result = self.enqueue(item).await;
                if result.is_ok() {
                    self.request_pass("enqueue");
                }
                let _ = reply.send(result);
            }
            Command::RetryFailed { id, reply } => {
                let result = self.retry_failed(&id).await;
                if result.is_ok() {
                    self.request_pass("retry");
                }
                let _ = reply.send(result);
            }
            Command::DiscardFailed { id, reply } => {
                let _ = reply.send(self.discard_failed(&id).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(WorkerStatus {
                    pass_running: self.running.is_some(),
                    reachable: self.reachable,
                    current_item_id: self.current_item.borrow().clone(),
                });
            }
            Command::Stop { reply } => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    fn on_reachability(&mut self, reachable: bool) {
        let was_reachable = std::mem::replace(&mut self.reachable, reachable);
        if reachable && !was_reachable {
            info!("Network reachable; starting drain pass");
            self.request_pass("reachability restored");
        } else if !reachable && was_reachable {
            info!("Network unreachable; drain pass stops before its next attempt");
        }
    }

    fn request_pass(&mut self, reason: &'static str) {
        match &self.running {
            Some(pass) => {
                debug!(reason, "Restarting drain pass");
                pass.cancel.cancel();
                self.rerun_requested = true;
            }
            None => self.start_pass(reason),
        }
    }

    fn start_pass(&mut self, reason: &'static str) {
        let cancel = CancellationToken::new();
        let context = PassContext {
            store: self.store.clone(),
            transport: self.transport.clone(),
            policy: self.policy,
            reachability: self.reachability.clone(),
            current_item: self.current_item.clone(),
        };

        let retries = std::mem::take(&mut self.retries);

        debug!(reason, "Starting drain pass");
        let task = tokio::spawn(drain_pass(context, cancel.clone(), retries));
        self.running = Some(RunningPass { cancel, task });
    }

    async fn shutdown(&mut self) {
        self.rerun_requested = false;
        if let Some(pass) = self.running.take() {
            pass.cancel.cancel();
            if let Err(e) = pass.task.await {
                warn!(error = %e, "Drain pass ended abnormally during shutdown");
            }
        }
        self.current_item.send_replace(None);
    }

    async fn enqueue(&self, mut item: OutboundItem) -> OutboundResult<()> {
        item.transition(OutboundStatus::Pending);
        item.last_error = None;
        self.store.put(&item).await?;
        info!(
            item_id = %item.id,
            conversation_id = %item.conversation_id,
            kind = item.payload.message_type(),
            "Outbound item enqueued"
        );
        Ok(())
    }

    async fn retry_failed(&self, id: &str) -> OutboundResult<()> {
        let mut item = self.load_failed(id).await?;
        item.transition(OutboundStatus::Pending);
        item.last_error = None;
        self.store.put(&item).await?;
        info!(item_id = %id, "Failed item re-enqueued");
        Ok(())
    }

    async fn discard_failed(&self, id: &str) -> OutboundResult<()> {
        let item = self.load_failed(id).await?;
        self.store.delete(&item.id).await?;
        if let Some(path) = &item.local_attachment_path {
            if let Err(e) = self.store.delete_attachment(path).await {
                warn!(item_id = %id, error = %e, "Failed to delete attachment of discarded item");
            }
        }
        info!(item_id = %id, "Failed item discarded");
        Ok(())
    }

    async fn load_failed(&self, id: &str) -> OutboundResult<OutboundItem> {
        let item = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OutboundError::NotFound(id.to_string()))?;
        if item.status != OutboundStatus::Failed {
            return Err(OutboundError::NotFailed {
                id: id.to_string(),
                status: item.status,
            });
        }
        Ok(item)
    }
}

async fn join_pass(running: &mut Option<RunningPass>) -> (PassSummary, RetryLedger) {
    match running {
        Some(pass) => match (&mut pass.task).await {
            Ok(finished) => finished,
            Err(e) => {
                warn!(error = %e, "Drain pass task failed; retry progress reset");
                let summary = PassSummary {
                    sent: 0,
                    failed: 0,
                    end: PassEnd::Aborted,
                };
                (summary, RetryLedger::new())
            }
        },
        None => std::future::pending().await,
    }
}

struct PassContext {
    store: Arc<dyn OutboundStore>,
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    reachability: watch::Receiver<bool>,
    current_item: Arc<watch::Sender<Option<String>>>,
}

impl PassContext {
    fn is_reachable(&self) -> bool {
        *self.reachability.borrow()
    }
}

enum ItemOutcome {
    Sent,
    Failed,
    Offline,
    Cancelled,
    /// Store bookkeeping failed; the item stays unresolved for a later pass.
    Deferred,
}

async fn drain_pass(
    context: PassContext,
    cancel: CancellationToken,
    mut retries: RetryLedger,
) -> (PassSummary, RetryLedger) {
    let mut summary = PassSummary {
        sent: 0,
        failed: 0,
        end: PassEnd::Drained,
    };

    let items = match context.store.list_unresolved().await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "Failed to load unresolved outbound items");
            summary.end = PassEnd::StoreUnavailable;
            return (summary, retries);
        }
    };
    debug!(count = items.len(), "Drain pass loaded unresolved items");

    {
        let unresolved: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
        retries.retain(|id, _| unresolved.contains(id.as_str()));
    }

    let now = Instant::now();
    let (ready, waiting): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| {
        !retries
            .get(&item.id)
            .is_some_and(|state| state.next_attempt_at > now)
    });
    if !waiting.is_empty() {
        debug!(
            ready = ready.len(),
            waiting = waiting.len(),
            "Items still in backoff moved to the back of the pass"
        );
    }

    for item in ready.into_iter().chain(waiting) {
        if cancel.is_cancelled() {
            summary.end = PassEnd::Cancelled;
            break;
        }
        if !context.is_reachable() {
            summary.end = PassEnd::Offline;
            break;
        }

        match deliver_item(&context, &mut retries, item, &cancel).await {
            ItemOutcome::Sent => summary.sent += 1,
            ItemOutcome::Failed => summary.failed += 1,
            ItemOutcome::Deferred => {}
            ItemOutcome::Offline => {
                summary.end = PassEnd::Offline;
                break;
            }
            ItemOutcome::Cancelled => {
                summary.end = PassEnd::Cancelled;
                break;
            }
        }
    }

    context.current_item.send_replace(None);
    (summary, retries)
}

async fn deliver_item(
    context: &PassContext,
    retries: &mut RetryLedger,
    mut item: OutboundItem,
    cancel: &CancellationToken,
) -> ItemOutcome {
    context.current_item.send_replace(Some(item.id.clone()));

    if item.status != OutboundStatus::Sending {
        item.transition(OutboundStatus::Sending);
        if let Err(e) = context.store.put(&item).await {
            warn!(item_id = %item.id, error = %e, "Failed to mark item sending");
            return ItemOutcome::Deferred;
        }
    }

    let max_attempts = context.policy.max_attempts;
    let mut state = retries
        .remove(&item.id)
        .unwrap_or_else(RetryState::fresh);
    if state.attempts > 0 {
        debug!(item_id = %item.id, attempts = state.attempts, "Resuming item retries");
    }

    while state.attempts < max_attempts {
        let attempt = state.attempts + 1;
        let wait = state
            .next_attempt_at
            .saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(
                item_id = %item.id,
                attempt,
                delay_ms = wait.as_millis() as u64,
                "Waiting before retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    retries.insert(item.id.clone(), state);
                    return ItemOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(state.next_attempt_at) => {}
            }
        }

        if cancel.is_cancelled() {
            retries.insert(item.id.clone(), state);
            return ItemOutcome::Cancelled;
        }
        if !context.is_reachable() {
            debug!(item_id = %item.id, attempt, "Network unreachable; pausing delivery");
            retries.insert(item.id.clone(), state);
            return ItemOutcome::Offline;
        }

        match attempt_delivery(context, &mut item).await {
            Ok(message) => return finish_sent(context, &item, &message, attempt).await,
            Err(e) => {
                warn!(
                    item_id = %item.id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Delivery attempt failed"
                );
                state.attempts = attempt;
                state.next_attempt_at =
                    Instant::now() + context.policy.delay_before_attempt(attempt + 1);
                state.last_error = Some(e.to_string());
            }
        }
    }

    item.transition(OutboundStatus::Failed);
    item.last_error = state.last_error.clone();
    if let Err(e) = context.store.put(&item).await {
        error!(item_id = %item.id, error = %e, "Failed to record exhausted item");
        retries.insert(item.id.clone(), state);
        return ItemOutcome::Deferred;
    }

    error!(
        item_id = %item.id,
        attempts = state.attempts,
        last_error = item.last_error.as_deref().unwrap_or_default(),
        "Outbound item failed; attempts exhausted"
    );
    ItemOutcome::Failed
}

async fn finish_sent(
    context: &PassContext,
    item: &OutboundItem,
    message: &ServerMessage,
    attempt: u32,
) -> ItemOutcome {
    if let Err(e) = context.store.confirm_sent(&item.id, message).await {
        // The server has the message; a later pass resends it (at-least-once).
        error!(
            item_id = %item.id,
            server_id = %message.id,
            error = %e,
            "Message sent but confirmation could not be stored"
        );
        return ItemOutcome::Deferred;
    }

    if let Some(path) = &item.local_attachment_path {
        if let Err(e) = context.store.delete_attachment(path).await {
            warn!(item_id = %item.id, error = %e, "Failed to delete sent attachment");
        }
    }

    info!(
        item_id = %item.id,
        server_id = %message.id,
        attempt,
        "Outbound item sent"
    );
    ItemOutcome::Sent
}

/// One network attempt: upload staged media if needed, then send.
async fn attempt_delivery(
    context: &PassContext,
    item: &mut OutboundItem,
) -> OutboundResult<ServerMessage> {
    if item.needs_upload() {
        upload_attachment(context, item).await?;
    }

    let conversation_id = item.conversation_id.as_str();
    let from_id = item.sender_id.as_str();
    let reply_to = item.reply_to_id.as_deref();
    let transport = &context.transport;

    match &item.payload {
        MessagePayload::Text { text } => {
            if text.trim().is_empty() {
                return Err(OutboundError::MissingPayload(
                    "text message has no text".to_string(),
                ));
            }
            transport
                .send_text(conversation_id, from_id, text, reply_to)
                .await
        }
        MessagePayload::Image { url, caption } => {
            let url = url.as_deref().ok_or_else(|| {
                OutboundError::MissingPayload("image has no uploaded URL or attachment".to_string())
            })?;
            transport
                .send_image(conversation_id, from_id, url, caption.as_deref(), reply_to)
                .await
        }
        MessagePayload::Audio { url, duration_secs } => {
            let url = url.as_deref().ok_or_else(|| {
                OutboundError::MissingPayload("audio has no uploaded URL or attachment".to_string())
            })?;
            transport
                .send_audio(conversation_id, from_id, url, *duration_secs, reply_to)
                .await
        }
        MessagePayload::Location {
            latitude,
            longitude,
            name,
        } => {
            transport
                .send_location(
                    conversation_id,
                    from_id,
                    *latitude,
                    *longitude,
                    name.as_deref(),
                    reply_to,
                )
                .await
        }
    }
}

/// Uploads the staged attachment and records its URL on the item so later
/// attempts skip the upload.
async fn upload_attachment(context: &PassContext, item: &mut OutboundItem) -> OutboundResult<()> {
    let (Some(path), Some(kind)) = (
        item.local_attachment_path.clone(),
        item.payload.attachment_kind(),
    ) else {
        return Ok(());
    };

    let bytes = context.store.load_attachment(&path).await?;
    let size = bytes.len();
    let url = context
        .transport
        .upload_attachment(bytes, &item.conversation_id, &item.sender_id, kind)
        .await?;

    debug!(item_id = %item.id, bytes = size, url = %url, "Attachment uploaded");
    item.payload.set_media_url(url);
    item.updated_at = Utc::now();
    context.store.put(item).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_until, FakeTransport, MemoryStore};
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;
    use std::time::Duration;

    fn text_item(conversation_id: &str, text: &str) -> OutboundItem {
        OutboundItem::new(
            conversation_id,
            "user-1",
            MessagePayload::Text {
                text: text.to_string(),
            },
        )
    }

    fn start_worker(
        store: &Arc<MemoryStore>,
        transport: &Arc<FakeTransport>,
        reachable: bool,
    ) -> (SendWorkerHandle, watch::Sender<bool>) {
        let (network, reachability) = watch::channel(reachable);
        let worker = SendWorker::new(
            SendWorkerConfig::default(),
            store.clone(),
            transport.clone(),
        );
        (worker.start(reachability), network)
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_item_is_replaced_by_confirmed_message() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let (handle, _network) = start_worker(&store, &transport, true);

        let item = text_item("conv-a", "on my way");
        handle.enqueue(item.clone()).await.unwrap();

        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
        assert!(store.item(&item.id).is_none());
        assert_eq!(transport.attempts_for("conv-a").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_item_backs_off_exponentially_then_fails() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_fail_all(true);

        let item = text_item("conv-a", "hello");
        store.seed(item.clone());
        let (_handle, _network) = start_worker(&store, &transport, true);

        wait_until(|| {
            store
                .item(&item.id)
                .is_some_and(|i| i.status == OutboundStatus::Failed)
        })
        .await;

        let attempts = transport.attempts_for("conv-a");
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1_000, 2_000, 4_000, 8_000]);

        let failed = store.item(&item.id).unwrap();
        assert!(failed
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("simulated outage")));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_network_makes_no_attempts_until_restored() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let item = text_item("conv-a", "queued offline");
        store.seed(item.clone());

        let (_handle, network) = start_worker(&store, &transport, false);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.attempt_count(), 0);
        assert_eq!(store.item(&item.id).unwrap().status, OutboundStatus::Pending);

        network.send(true).unwrap();
        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
        assert_eq!(transport.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_network_pauses_without_marking_failure() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_fail_all(true);
        let item = text_item("conv-a", "flaky");
        store.seed(item.clone());

        let (_handle, network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempt_count() == 1).await;
        network.send(false).unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempt_count(), 1);
        let paused = store.item(&item.id).unwrap();
        assert_eq!(paused.status, OutboundStatus::Sending);
        assert!(paused.last_error.is_none());

        transport.set_fail_all(false);
        network.send(true).unwrap();
        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
    }

    fn has_failed(store: &MemoryStore, id: &str) -> bool {
        store
            .item(id)
            .is_some_and(|i| i.status == OutboundStatus::Failed)
    }

    fn gaps_ms(attempts: &[Instant]) -> Vec<u64> {
        attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn notify_delivers_new_item_while_older_item_backs_off() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.fail_conversation("conv-a");
        let stuck = text_item("conv-a", "stuck");
        store.seed(stuck.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempts_for("conv-a").len() == 3).await;

        // The pass is now inside a 4s wait before attempt 4.
        let fresh = text_item("conv-b", "fresh");
        store.seed(fresh.clone());
        handle.notify_new_pending_message();

        wait_until(|| store.confirmed_ids().contains(&fresh.id)).await;
        assert_eq!(transport.attempts_for("conv-a").len(), 3);

        wait_until(|| has_failed(&store, &stuck.id)).await;
        let attempts = transport.attempts_for("conv-a");
        assert_eq!(attempts.len(), 5);
        assert_eq!(gaps_ms(&attempts), vec![1_000, 2_000, 4_000, 8_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_churn_keeps_attempt_budget_of_failing_item() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.fail_conversation("conv-a");
        let stuck = text_item("conv-a", "stuck");
        store.seed(stuck.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        for n in 0..20 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle
                .enqueue(text_item("conv-b", &format!("update {n}")))
                .await
                .unwrap();
        }

        wait_until(|| has_failed(&store, &stuck.id)).await;
        wait_until(|| store.confirmed_ids().len() == 20).await;

        assert_eq!(transport.attempts_for("conv-a").len(), 5);
        assert_eq!(transport.attempts_for("conv-b").len(), 20);
        assert_eq!(transport.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_loss_resumes_backoff_where_it_stopped() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_fail_all(true);
        let item = text_item("conv-a", "patchy signal");
        store.seed(item.clone());

        let (_handle, network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempt_count() == 2).await;
        network.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        network.send(true).unwrap();

        wait_until(|| has_failed(&store, &item.id)).await;
        assert_eq!(transport.attempt_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_notifies_never_overlap_attempts() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_send_delay(Duration::from_millis(500));
        let item = text_item("conv-a", "slow network");
        store.seed(item.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempt_count() == 1).await;
        for _ in 0..10 {
            handle.notify_new_pending_message();
        }

        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.max_concurrent(), 1);
        assert_eq!(transport.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_attempted_oldest_first() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let base = Utc::now();
        for (offset, conversation) in [(2, "conv-c"), (0, "conv-a"), (1, "conv-b")] {
            let mut item = text_item(conversation, "hi");
            item.created_at = base + ChronoDuration::seconds(offset);
            store.seed(item);
        }

        let (_handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| store.confirmed_ids().len() == 3).await;
        assert_eq!(
            transport.attempted_conversations(),
            vec!["conv-a", "conv-b", "conv-c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attachment_is_uploaded_once_and_deleted_after_send() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.fail_next_sends(1);

        let path = PathBuf::from("/attachments/photo.jpg");
        store.add_attachment(&path, vec![1, 2, 3]);
        let item = OutboundItem::new(
            "conv-a",
            "user-1",
            MessagePayload::Image {
                url: None,
                caption: Some("view".to_string()),
            },
        )
        .with_attachment(&path);
        store.seed(item.clone());

        let (_handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| store.confirmed_ids().contains(&item.id)).await;

        assert_eq!(transport.upload_count(), 1);
        assert_eq!(transport.attempts_for("conv-a").len(), 2);
        assert!(!store.has_attachment(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_payload_consumes_attempts_and_fails() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let item = OutboundItem::new(
            "conv-a",
            "user-1",
            MessagePayload::Image {
                url: None,
                caption: None,
            },
        );
        store.seed(item.clone());

        let (_handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| {
            store
                .item(&item.id)
                .is_some_and(|i| i.status == OutboundStatus::Failed)
        })
        .await;

        let failed = store.item(&item.id).unwrap();
        assert!(failed.last_error.unwrap().contains("Missing payload"));
        assert_eq!(transport.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_reenqueues_and_delivers() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_fail_all(true);
        let item = text_item("conv-a", "try again");
        store.seed(item.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| {
            store
                .item(&item.id)
                .is_some_and(|i| i.status == OutboundStatus::Failed)
        })
        .await;

        transport.set_fail_all(false);
        handle.retry_failed(&item.id).await.unwrap();
        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn discard_failed_removes_item_and_attachment() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let path = PathBuf::from("/attachments/voice.m4a");
        store.add_attachment(&path, vec![9; 16]);

        let mut item = OutboundItem::new(
            "conv-a",
            "user-1",
            MessagePayload::Audio {
                url: None,
                duration_secs: 3.0,
            },
        )
        .with_attachment(&path);
        item.status = OutboundStatus::Failed;
        item.last_error = Some("Transport error: simulated outage".to_string());
        store.seed(item.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        handle.discard_failed(&item.id).await.unwrap();

        assert!(store.item(&item.id).is_none());
        assert!(!store.has_attachment(&path));
        assert_eq!(transport.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_operations_reject_unknown_and_unfailed_items() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let item = text_item("conv-a", "still pending");
        store.seed(item.clone());

        let (handle, _network) = start_worker(&store, &transport, false);

        assert!(matches!(
            handle.retry_failed("missing").await,
            Err(OutboundError::NotFound(_))
        ));
        assert!(matches!(
            handle.discard_failed(&item.id).await,
            Err(OutboundError::NotFailed {
                status: OutboundStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_backoff_without_failing_item() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_fail_all(true);
        let item = text_item("conv-a", "interrupted");
        store.seed(item.clone());

        let (handle, _network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempt_count() == 2).await;
        handle.stop().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempt_count(), 2);
        assert_eq!(store.item(&item.id).unwrap().status, OutboundStatus::Sending);
        assert!(handle.is_stopped());
        assert!(matches!(
            handle.enqueue(text_item("conv-b", "late")).await,
            Err(OutboundError::WorkerStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_reachability_and_current_item() {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        transport.set_send_delay(Duration::from_secs(10));
        let item = text_item("conv-a", "in flight");
        store.seed(item.clone());

        let (handle, network) = start_worker(&store, &transport, true);
        wait_until(|| transport.attempt_count() == 1).await;

        let status = handle.status().await.unwrap();
        assert!(status.pass_running);
        assert!(status.reachable);
        assert_eq!(status.current_item_id.as_deref(), Some(item.id.as_str()));

        wait_until(|| store.confirmed_ids().contains(&item.id)).await;
        network.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = handle.status().await.unwrap();
        assert!(!status.pass_running);
        assert!(!status.reachable);
        assert_eq!(status.current_item_id, None);
    }
}
