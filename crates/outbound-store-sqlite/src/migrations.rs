//! Schema migrations for the outbound store.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbound_items(conn)?;
    }
    if current_version < 2 {
        migrate_v2_confirmed_messages(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: optimistic outbound items awaiting delivery.
fn migrate_v1_outbound_items(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE outbound_items (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            local_attachment_path TEXT,
            reply_to_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_outbound_items_status_created
            ON outbound_items(status, created_at);
        ",
    )?;
    record_migration(conn, 1, "outbound_items")
}

/// V2: server-confirmed messages that replaced outbound items.
fn migrate_v2_confirmed_messages(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE confirmed_messages (
            id TEXT PRIMARY KEY,
            local_id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            confirmed_at TEXT NOT NULL
        );

        CREATE INDEX idx_confirmed_messages_conversation
            ON confirmed_messages(conversation_id, created_at);
        ",
    )?;
    record_migration(conn, 2, "confirmed_messages")
}
