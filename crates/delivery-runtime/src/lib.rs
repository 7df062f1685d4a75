//! # Delivery Runtime
//!
//! Wires the client delivery layer together: loads [`Config`] and logging,
//! opens the SQLite outbound store under the app's base directory, starts the
//! send worker and the realtime multiplexer, and fans app lifecycle events
//! into both.
//!
//! ```ignore
//! let runtime = DeliveryRuntime::start(Paths::new()?, RuntimeSignals {
//!     reachability: reachability_rx,
//!     access_token: token_rx,
//!     change_feed: Arc::new(feed),
//! })
//! .await?;
//! runtime.handle_lifecycle(LifecycleEvent::EnteredBackground).await?;
//! ```
//!
//! [`Config`]: client_config_and_utils::Config

mod error;
mod runtime;
mod settings;

pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{DeliveryRuntime, RuntimeSignals};
pub use settings::{multiplexer_config, request_timeout, send_worker_config};

pub use realtime_subscription_multiplexer::LifecycleEvent;
