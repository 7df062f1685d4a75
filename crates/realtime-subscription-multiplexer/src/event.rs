//! Change events and decoding of raw change-feed notifications.

use crate::{RealtimeError, RealtimeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Row change kind reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    /// Case-insensitive parse of the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table-agnostic row change delivered to subscribers.
///
/// For deletes `record` is usually empty and the removed row is in
/// `old_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Map<String, Value>,
    pub old_record: Option<Map<String, Value>>,
}

/// Loosely-typed notification body. Accepts both the client-library shape
/// (`eventType`/`new`/`old`) and the raw socket shape (`type`/`record`/`old_record`).
#[derive(Debug, Deserialize)]
struct RawChange {
    #[serde(default)]
    table: Option<String>,
    #[serde(default, alias = "eventType", alias = "type")]
    event_type: Option<String>,
    #[serde(default, alias = "record")]
    new: Option<Value>,
    #[serde(default, alias = "old_record")]
    old: Option<Value>,
}

/// Decodes one raw notification received by a listener for `table`/`kind`.
///
/// The payload may be wrapped in a `data` object. A kind carried by the
/// payload wins over the listener's kind.
pub fn decode_change(table: &str, kind: ChangeKind, raw: &Value) -> RealtimeResult<ChangeEvent> {
    if !raw.is_object() {
        return Err(RealtimeError::Decode(format!(
            "expected an object, got {}",
            value_kind(raw)
        )));
    }
    let body = raw.get("data").filter(|data| data.is_object()).unwrap_or(raw);

    let change: RawChange = serde_json::from_value(body.clone())
        .map_err(|e| RealtimeError::Decode(e.to_string()))?;

    let kind = match change.event_type.as_deref() {
        Some(name) => ChangeKind::parse(name)
            .ok_or_else(|| RealtimeError::Decode(format!("unknown event type '{}'", name)))?,
        None => kind,
    };

    let record = field_map("new", change.new)?.unwrap_or_default();
    let old_record = field_map("old", change.old)?.filter(|old| !old.is_empty());

    Ok(ChangeEvent {
        table: change.table.unwrap_or_else(|| table.to_string()),
        kind,
        record,
        old_record,
    })
}

fn field_map(name: &str, value: Option<Value>) -> RealtimeResult<Option<Map<String, Value>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(RealtimeError::Decode(format!(
            "'{}' must be an object, got {}",
            name,
            value_kind(&other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
