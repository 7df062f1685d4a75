//! # Realtime Subscription Multiplexer
//!
//! Shares a capped number of live change-feed channels across every part of
//! the app that wants row updates. One owner task holds the channel table;
//! handles talk to it with commands.
//!
//! - `subscribe` is idempotent per channel name and returns a broadcast
//!   receiver of decoded [`ChangeEvent`]s.
//! - At capacity the oldest unprotected channel is evicted; protected
//!   prefixes (active threads, dashboards) go only when nothing else can.
//! - Backgrounding starts a grace timer. If it expires, channels close but
//!   their configurations stay, and the next foreground reopens them.
//! - A new access token re-authenticates the transport and reopens every
//!   tracked channel.
//!
//! ```ignore
//! let mux = RealtimeMultiplexer::start(MultiplexerConfig::default(), feed, token_rx);
//! let mut events = mux
//!     .subscribe(SubscriptionRequest::new("messages:42", "messages").with_filter("conversation_id=eq.42"))
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     // ...
//! }
//! ```

mod error;
mod event;
mod multiplexer;
mod policy;
mod transport;

#[cfg(test)]
mod test_support;

pub use error::{RealtimeError, RealtimeResult};
pub use event::{decode_change, ChangeEvent, ChangeKind};
pub use multiplexer::{
    ChannelInfo, LifecycleEvent, MultiplexerConfig, RealtimeMultiplexer, SubscriptionRequest,
    DEFAULT_BACKGROUND_GRACE_PERIOD, DEFAULT_MAX_CONCURRENT_SUBSCRIPTIONS,
};
pub use policy::{auth_fingerprint, is_protected, ANONYMOUS_FINGERPRINT};
pub use transport::{ChangeFeedTransport, ChannelHandle};
