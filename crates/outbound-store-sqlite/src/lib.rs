//! # Outbound Store (SQLite)
//!
//! Durable storage for the outbound send queue. Rows live in a single SQLite
//! file accessed through an async executor thread; attachment bytes live as
//! plain files beside it until their item is confirmed.
//!
//! Schema:
//! - `outbound_items`: optimistic local messages (`pending`, `sending`, `failed`)
//! - `confirmed_messages`: server rows that replaced a local item
//! - `migrations`: applied schema versions

mod error;
mod executor;
mod migrations;
mod queries;
mod store;

pub use error::{StoreError, StoreResult};
pub use executor::AsyncDatabase;
pub use migrations::CURRENT_VERSION;
pub use store::SqliteOutboundStore;
