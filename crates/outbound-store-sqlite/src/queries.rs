//! SQL for outbound items and confirmed messages.
//!
//! Functions take a borrowed connection and run inside `AsyncDatabase::call`.

use crate::{StoreError, StoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use outbound_send_worker::{MessagePayload, OutboundItem, OutboundStatus, ServerMessage};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use tracing::warn;

const ITEM_COLUMNS: &str = "id, conversation_id, sender_id, payload, local_attachment_path, \
                            reply_to_id, status, last_error, created_at, updated_at";

/// Raw `outbound_items` row before payload/status decoding.
struct ItemRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    payload: String,
    local_attachment_path: Option<String>,
    reply_to_id: Option<String>,
    status: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            payload: row.get(3)?,
            local_attachment_path: row.get(4)?,
            reply_to_id: row.get(5)?,
            status: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_item(self) -> StoreResult<OutboundItem> {
        let payload: MessagePayload = serde_json::from_str(&self.payload)?;
        let status = OutboundStatus::parse(&self.status).ok_or_else(|| {
            StoreError::InvalidData(format!("unknown status '{}' for {}", self.status, self.id))
        })?;

        Ok(OutboundItem {
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            payload,
            local_attachment_path: self.local_attachment_path.map(PathBuf::from),
            reply_to_id: self.reply_to_id,
            status,
            last_error: self.last_error,
        })
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{}': {}", s, e)))
}

/// Insert or replace an outbound item.
pub fn upsert_item(conn: &Connection, item: &OutboundItem) -> StoreResult<()> {
    let payload = serde_json::to_string(&item.payload)?;
    let attachment = item
        .local_attachment_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());

    conn.execute(
        "INSERT INTO outbound_items (id, conversation_id, sender_id, payload, local_attachment_path,
                                     reply_to_id, status, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            local_attachment_path = excluded.local_attachment_path,
            reply_to_id = excluded.reply_to_id,
            status = excluded.status,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            item.id,
            item.conversation_id,
            item.sender_id,
            payload,
            attachment,
            item.reply_to_id,
            item.status.as_str(),
            item.last_error,
            format_datetime(&item.created_at),
            format_datetime(&item.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_item(conn: &Connection, id: &str) -> StoreResult<Option<OutboundItem>> {
    let row = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM outbound_items WHERE id = ?1"),
            [id],
            ItemRow::from_row,
        )
        .optional()?;
    row.map(ItemRow::into_item).transpose()
}

/// Items with one of `statuses`, oldest first.
///
/// Rows that cannot be decoded are logged and skipped so one corrupt item
/// does not hold up the rest of the queue.
pub fn list_items_by_status(
    conn: &Connection,
    statuses: &[OutboundStatus],
) -> StoreResult<Vec<OutboundItem>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = (1..=statuses.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM outbound_items
         WHERE status IN ({placeholders})
         ORDER BY created_at ASC, id ASC"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
        ItemRow::from_row,
    )?;

    let mut items = Vec::new();
    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(
                e @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)),
            ) => {
                warn!(error = %e, "Skipping unreadable outbound item row");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let id = row.id.clone();
        match row.into_item() {
            Ok(item) => items.push(item),
            Err(e) => warn!(item_id = %id, error = %e, "Skipping undecodable outbound item"),
        }
    }
    Ok(items)
}

pub fn delete_item(conn: &Connection, id: &str) -> StoreResult<bool> {
    let deleted = conn.execute("DELETE FROM outbound_items WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}

/// Replace the optimistic item with the server-confirmed message atomically.
pub fn confirm_sent(
    conn: &Connection,
    local_id: &str,
    message: &ServerMessage,
) -> StoreResult<()> {
    let body = serde_json::to_string(message)?;
    let tx = conn.unchecked_transaction()?;

    tx.execute("DELETE FROM outbound_items WHERE id = ?1", [local_id])?;
    tx.execute(
        "INSERT INTO confirmed_messages (id, local_id, conversation_id, body, created_at, confirmed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            body = excluded.body,
            confirmed_at = excluded.confirmed_at",
        params![
            message.id,
            local_id,
            message.conversation_id,
            body,
            format_datetime(&message.created_at),
            format_datetime(&Utc::now()),
        ],
    )?;

    tx.commit()?;
    Ok(())
}

/// Confirmed message that replaced the local item `local_id`.
pub fn get_confirmed_by_local_id(
    conn: &Connection,
    local_id: &str,
) -> StoreResult<Option<ServerMessage>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM confirmed_messages WHERE local_id = ?1",
            [local_id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
        .transpose()
}

/// Confirmed messages in a conversation, oldest first.
pub fn list_confirmed_for_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> StoreResult<Vec<ServerMessage>> {
    let mut stmt = conn.prepare(
        "SELECT body FROM confirmed_messages
         WHERE conversation_id = ?1
         ORDER BY created_at ASC",
    )?;
    let bodies = stmt.query_map([conversation_id], |row| row.get::<_, String>(0))?;

    let mut messages = Vec::new();
    for body in bodies {
        messages.push(serde_json::from_str(&body?)?);
    }
    Ok(messages)
}
