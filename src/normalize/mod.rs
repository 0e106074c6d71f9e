//! Normalizer: raw platform payloads to internal records
//!
//! Pure functions, no I/O. Two input dialects are understood:
//!
//! - **Telegram**: Bot API `Update` objects, recognized by a top-level
//!   `update_id`.
//! - **Generic**: flat objects keyed by `id` and `type`, the shape used by
//!   replay files and other ingestion paths.
//!
//! Anything missing a source id or a usable timestamp is rejected with
//! [`MalformedEventError`]; such events are never retried.

mod generic;
mod telegram;

use crate::model::{Event, Message, MessageEdit, MessageId};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a raw event could not be normalized
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedEventError {
    #[error("event is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl MalformedEventError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// The state change an event asks for
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// First sighting of a message
    Create(Message),
    /// New content for a message
    Edit(MessageEdit),
    /// Logical deletion of a message
    Tombstone(MessageId),
    /// No message changes; the event is only recorded
    Record,
}

/// A normalized inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event: Event,
    pub change: Change,
}

impl NormalizedEvent {
    /// The message this event touches, if any
    pub fn target(&self) -> Option<&MessageId> {
        match &self.change {
            Change::Create(message) => Some(&message.id),
            Change::Edit(edit) => Some(&edit.target),
            Change::Tombstone(id) => Some(id),
            Change::Record => self.event.message_id.as_ref(),
        }
    }
}

/// Normalize a raw event payload
pub fn normalize(raw: &Value) -> Result<NormalizedEvent, MalformedEventError> {
    let object = raw.as_object().ok_or(MalformedEventError::NotAnObject)?;
    if object.contains_key("update_id") {
        telegram::normalize_update(object)
    } else {
        generic::normalize_event(object)
    }
}

/// Parse and normalize a raw JSON document
pub fn normalize_str(raw: &str) -> Result<NormalizedEvent, MalformedEventError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| MalformedEventError::InvalidJson(e.to_string()))?;
    normalize(&value)
}

// ---------------------------------------------------------------------------
// Field helpers shared by both dialects
// ---------------------------------------------------------------------------

/// An identifier given either as a non-empty string or an integer
fn id_field(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, MalformedEventError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(MalformedEventError::invalid(field, "empty identifier"))
        }
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        Some(other) => Err(MalformedEventError::invalid(
            field,
            format!("expected string or integer, got {}", json_type(other)),
        )),
    }
}

fn int_field(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<i64>, MalformedEventError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| MalformedEventError::invalid(field, "integer out of range")),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| MalformedEventError::invalid(field, format!("'{}' is not an integer", s))),
        Some(other) => Err(MalformedEventError::invalid(
            field,
            format!("expected integer, got {}", json_type(other)),
        )),
    }
}

fn str_field(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, MalformedEventError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(MalformedEventError::invalid(
            field,
            format!("expected string, got {}", json_type(other)),
        )),
    }
}

/// A timestamp given as RFC 3339 text or integer unix seconds
fn timestamp_field(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, MalformedEventError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let secs = n
                .as_i64()
                .ok_or_else(|| MalformedEventError::invalid(field, "unix seconds must be an integer"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .map(Some)
                .ok_or_else(|| MalformedEventError::invalid(field, "unix seconds out of range"))
        }
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| MalformedEventError::invalid(field, e.to_string())),
        Some(other) => Err(MalformedEventError::invalid(
            field,
            format!("expected RFC 3339 string or unix seconds, got {}", json_type(other)),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
