//! Row <-> record conversion for the SQLite backend

use super::traits::{ParkedEvent, StorageError, StorageResult};
use crate::model::{
    AuditLogEntry, AuditOperation, Collection, Event, EventKind, Message, MessageId,
};
use chrono::{DateTime, Utc};
use rusqlite::Row;

pub(super) const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, sender_name, text, caption, \
     attachments_json, reply_to, forwarded_from, timestamp, edit_count, edited_at, deleted_at";

pub(super) const EVENT_COLUMNS: &str = "id, kind, message_id, chat_id, payload_json, timestamp";

pub(super) const AUDIT_COLUMNS: &str =
    "id, operation, actor, target_collection, target_id, before_json, after_json, timestamp";

pub(super) const PARKED_COLUMNS: &str = "id, source, raw, reason, attempts, parked_at";

pub(super) fn to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(super) fn parse_ts(text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(format!("{}: {}", text, e)))
}

fn parse_opt_ts(text: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_ts).transpose()
}

/// Raw columns of a `messages` row, read in `MESSAGE_COLUMNS` order
pub(super) struct MessageRow {
    id: String,
    chat_id: i64,
    sender_id: Option<i64>,
    sender_name: Option<String>,
    text: Option<String>,
    caption: Option<String>,
    attachments_json: String,
    reply_to: Option<String>,
    forwarded_from: Option<String>,
    timestamp: String,
    edit_count: u32,
    edited_at: Option<String>,
    deleted_at: Option<String>,
}

impl MessageRow {
    /// Read the message columns starting at `offset`
    pub(super) fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            chat_id: row.get(offset + 1)?,
            sender_id: row.get(offset + 2)?,
            sender_name: row.get(offset + 3)?,
            text: row.get(offset + 4)?,
            caption: row.get(offset + 5)?,
            attachments_json: row.get(offset + 6)?,
            reply_to: row.get(offset + 7)?,
            forwarded_from: row.get(offset + 8)?,
            timestamp: row.get(offset + 9)?,
            edit_count: row.get(offset + 10)?,
            edited_at: row.get(offset + 11)?,
            deleted_at: row.get(offset + 12)?,
        })
    }

    pub(super) fn into_message(self) -> StorageResult<Message> {
        Ok(Message {
            id: MessageId::from(self.id),
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            text: self.text,
            caption: self.caption,
            attachments: serde_json::from_str(&self.attachments_json)?,
            reply_to: self.reply_to.map(MessageId::from),
            forwarded_from: self.forwarded_from,
            timestamp: parse_ts(&self.timestamp)?,
            edit_count: self.edit_count,
            edited_at: parse_opt_ts(self.edited_at)?,
            deleted_at: parse_opt_ts(self.deleted_at)?,
        })
    }
}

pub(super) struct EventRow {
    id: String,
    kind: String,
    message_id: Option<String>,
    chat_id: Option<i64>,
    payload_json: String,
    timestamp: String,
}

impl EventRow {
    pub(super) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            message_id: row.get(2)?,
            chat_id: row.get(3)?,
            payload_json: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    pub(super) fn into_event(self) -> StorageResult<Event> {
        Ok(Event {
            id: self.id.into(),
            kind: EventKind::parse(&self.kind),
            message_id: self.message_id.map(MessageId::from),
            chat_id: self.chat_id,
            payload: serde_json::from_str(&self.payload_json)?,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

pub(super) struct AuditRow {
    id: String,
    operation: String,
    actor: String,
    target_collection: String,
    target_id: String,
    before_json: Option<String>,
    after_json: Option<String>,
    timestamp: String,
}

impl AuditRow {
    pub(super) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation: row.get(1)?,
            actor: row.get(2)?,
            target_collection: row.get(3)?,
            target_id: row.get(4)?,
            before_json: row.get(5)?,
            after_json: row.get(6)?,
            timestamp: row.get(7)?,
        })
    }

    pub(super) fn into_entry(self) -> StorageResult<AuditLogEntry> {
        let operation = AuditOperation::parse(&self.operation).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown audit operation '{}'", self.operation))
        })?;
        let target_collection = Collection::parse(&self.target_collection).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown collection '{}'", self.target_collection))
        })?;
        Ok(AuditLogEntry {
            id: uuid::Uuid::parse_str(&self.id)
                .map_err(|e| StorageError::Corrupt(format!("bad audit id: {}", e)))?,
            operation,
            actor: self.actor,
            target_collection,
            target_id: self.target_id,
            before: self.before_json.as_deref().map(serde_json::from_str).transpose()?,
            after: self.after_json.as_deref().map(serde_json::from_str).transpose()?,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

pub(super) fn read_parked(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, u32, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

pub(super) fn into_parked(
    (id, source, raw, reason, attempts, parked_at): (i64, String, String, String, u32, String),
) -> StorageResult<ParkedEvent> {
    Ok(ParkedEvent {
        id,
        source,
        raw,
        reason,
        attempts,
        parked_at: parse_ts(&parked_at)?,
    })
}
