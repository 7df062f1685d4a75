//! # Outbound Send Worker
//!
//! Durable delivery of outbound chat messages. Items are persisted locally as
//! `pending`, then a single worker drives each one to `sent` (replaced by the
//! server-confirmed row) or `failed` (with the last error kept for the user).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ enqueue/notify ┌──────────────┐  spawn   ┌────────────┐
//! │ UI / service │───────────────▶│ owner task   │─────────▶│ drain pass │
//! └──────────────┘                │ (commands,   │◀─────────│ (one item  │
//!                                 │ reachability)│  joined  │  at a time)│
//!                                 └──────────────┘          └─────┬──────┘
//!                                                                 │
//!                                  ┌───────────────┐   ┌──────────▼─────────┐
//!                                  │ OutboundStore │◀──│ DeliveryTransport  │
//!                                  └───────────────┘   └────────────────────┘
//! ```
//!
//! - Each item gets up to 5 attempts with backoff `min(1s·2^(n-2), 30s)`.
//! - Losing the network stops the pass before its next attempt; regaining it
//!   starts a fresh pass.
//! - A notify cancels the running pass's backoff wait and restarts the pass.
//!   The replacement starts only after the old pass has exited.
//!   Attempts already used survive the restart; an item still waiting out its
//!   backoff moves behind the rest of the queue.
//! - Delivery is at-least-once: a crash between server acceptance and the
//!   local confirmation resends the message on the next start.
//!
//! ```ignore
//! let worker = SendWorker::new(SendWorkerConfig::default(), store, transport);
//! let handle = worker.start(reachability_rx);
//! handle.enqueue(OutboundItem::new(conversation_id, user_id, payload)).await?;
//! ```

mod backoff;
mod error;
mod model;
mod store;
mod supabase;
mod transport;
mod worker;

#[cfg(test)]
mod test_support;

pub use backoff::BackoffPolicy;
pub use error::{OutboundError, OutboundResult};
pub use model::{AttachmentKind, MessagePayload, OutboundItem, OutboundStatus, ServerMessage};
pub use store::OutboundStore;
pub use supabase::{SupabaseDeliveryTransport, MEDIA_BUCKET, MESSAGES_TABLE};
pub use transport::DeliveryTransport;
pub use worker::{SendWorker, SendWorkerConfig, SendWorkerHandle, WorkerStatus};
