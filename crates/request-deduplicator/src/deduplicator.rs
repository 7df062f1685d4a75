//! Ledger owner task and the cloneable handle that talks to it.

use crate::{DedupError, DedupResult};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type BoxedOperation<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;
type Waiter<T, E> = oneshot::Sender<DedupResult<T, E>>;

enum Command<T, E> {
    Fetch {
        key: String,
        operation: BoxedOperation<T, E>,
        reply: Waiter<T, E>,
    },
    Cancel {
        key: String,
    },
    CancelAll,
    InFlight {
        reply: oneshot::Sender<Vec<String>>,
    },
    WaiterCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
}

struct Completion<T, E> {
    key: String,
    generation: u64,
    result: DedupResult<T, E>,
}

struct InFlight<T, E> {
    generation: u64,
    cancel: CancellationToken,
    waiters: Vec<Waiter<T, E>>,
}

/// Coalesces concurrent requests for the same key into one shared operation.
///
/// Cloning the handle is cheap; all clones talk to the same ledger. The
/// ledger owner exits once every handle has been dropped, cancelling any
/// operation still in flight.
pub struct RequestDeduplicator<T, E> {
    commands: mpsc::UnboundedSender<Command<T, E>>,
}

impl<T, E> Clone for RequestDeduplicator<T, E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Spawns the ledger owner on the current tokio runtime.
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_ledger(receiver));
        Self { commands }
    }

    /// Runs `operation` for `key` unless an operation for `key` is already in
    /// flight, in which case the caller waits for that one instead.
    ///
    /// `operation` is only invoked when this call starts fresh work.
    pub async fn fetch<F, Fut>(&self, key: impl Into<String>, operation: F) -> DedupResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let operation: BoxedOperation<T, E> =
            Box::new(move || -> BoxFuture<'static, Result<T, E>> { Box::pin(operation()) });

        self.commands
            .send(Command::Fetch {
                key: key.into(),
                operation,
                reply,
            })
            .map_err(|_| DedupError::Closed)?;

        receiver.await.map_err(|_| DedupError::Closed)?
    }

    /// Cancels the in-flight operation for `key`, if any.
    ///
    /// Attached callers receive [`DedupError::Cancelled`].
    pub fn cancel(&self, key: impl Into<String>) {
        let _ = self.commands.send(Command::Cancel { key: key.into() });
    }

    /// Cancels every in-flight operation.
    pub fn cancel_all(&self) {
        let _ = self.commands.send(Command::CancelAll);
    }

    /// Keys that currently have an operation in flight, sorted.
    pub async fn in_flight_keys(&self) -> Vec<String> {
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(Command::InFlight { reply }).is_err() {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }

    /// Number of callers waiting on the in-flight operation for `key`.
    pub async fn waiter_count(&self, key: impl Into<String>) -> usize {
        let (reply, receiver) = oneshot::channel();
        let command = Command::WaiterCount {
            key: key.into(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return 0;
        }
        receiver.await.unwrap_or(0)
    }
}

impl<T, E> Default for RequestDeduplicator<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Ledger<T, E> {
    entries: HashMap<String, InFlight<T, E>>,
    next_generation: u64,
    completions: mpsc::UnboundedSender<Completion<T, E>>,
}

impl<T, E> Ledger<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn fetch(&mut self, key: String, operation: BoxedOperation<T, E>, reply: Waiter<T, E>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.waiters.push(reply);
            debug!(
                key = %key,
                waiters = entry.waiters.len(),
                "Attached to in-flight request"
            );
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let completions = self.completions.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            let future = operation();
            let result = tokio::select! {
                _ = token.cancelled() => Err(DedupError::Cancelled),
                result = future => result.map_err(DedupError::Operation),
            };
            let _ = completions.send(Completion {
                key: task_key,
                generation,
                result,
            });
        });

        debug!(key = %key, generation, "Started request");
        self.entries.insert(
            key,
            InFlight {
                generation,
                cancel,
                waiters: vec![reply],
            },
        );
    }

    fn complete(&mut self, completion: Completion<T, E>) {
        let matches = self
            .entries
            .get(&completion.key)
            .is_some_and(|entry| entry.generation == completion.generation);
        if !matches {
            // Cancelled entries were already settled and removed.
            return;
        }

        if let Some(entry) = self.entries.remove(&completion.key) {
            debug!(
                key = %completion.key,
                waiters = entry.waiters.len(),
                ok = completion.result.is_ok(),
                "Request settled"
            );
            for waiter in entry.waiters {
                let _ = waiter.send(completion.result.clone());
            }
        }
    }

    fn cancel(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            debug!(key = %key, waiters = entry.waiters.len(), "Cancelling request");
            settle_cancelled(entry);
        }
    }

    fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            settle_cancelled(entry);
        }
    }
}

fn settle_cancelled<T, E>(entry: InFlight<T, E>) {
    entry.cancel.cancel();
    for waiter in entry.waiters {
        let _ = waiter.send(Err(DedupError::Cancelled));
    }
}

async fn run_ledger<T, E>(mut commands: mpsc::UnboundedReceiver<Command<T, E>>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (completions, mut completed) = mpsc::unbounded_channel();
    let mut ledger = Ledger {
        entries: HashMap::new(),
        next_generation: 0,
        completions,
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    Command::Fetch { key, operation, reply } => ledger.fetch(key, operation, reply),
                    Command::Cancel { key } => ledger.cancel(&key),
                    Command::CancelAll => ledger.cancel_all(),
                    Command::InFlight { reply } => {
                        let mut keys: Vec<String> = ledger.entries.keys().cloned().collect();
                        keys.sort();
                        let _ = reply.send(keys);
                    }
                    Command::WaiterCount { key, reply } => {
                        let count = ledger.entries.get(&key).map_or(0, |e| e.waiters.len());
                        let _ = reply.send(count);
                    }
                }
            }
            Some(completion) = completed.recv() => ledger.complete(completion),
        }
    }

    ledger.cancel_all();
}
