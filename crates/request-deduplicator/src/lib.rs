//! # Request Deduplicator
//!
//! Coalesces concurrent fetches of the same logical resource into a single
//! in-flight operation. Every caller attached to a key receives a clone of
//! the one result (or error). Nothing is cached: once the operation settles
//! its ledger entry is removed and the next call for that key starts fresh.
//!
//! ```ignore
//! let dedup: RequestDeduplicator<Profile, ApiError> = RequestDeduplicator::new();
//! let profile = dedup
//!     .fetch("profile:123", move || async move { api.fetch_profile(123).await })
//!     .await?;
//! ```
//!
//! The ledger is owned by a single background task. Handles only send it
//! commands, so no lock guards the in-flight map.

mod deduplicator;
mod error;

pub use deduplicator::RequestDeduplicator;
pub use error::{DedupError, DedupResult};
