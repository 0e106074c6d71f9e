//! Idempotency gate
//!
//! Uniqueness is enforced by the primary keys of `events` and `messages`:
//! a claim is an `INSERT ... ON CONFLICT DO NOTHING`, so two writers racing
//! on the same identifier cannot both be accepted. Claims run inside the
//! caller's write transaction; a later failure in that transaction rolls the
//! claim back with everything else.

use super::rows::to_text;
use super::traits::{Admission, StorageResult};
use crate::model::{Event, Message};
use rusqlite::{params, Connection};

/// Claim an event id
pub fn claim_event(conn: &Connection, event: &Event) -> StorageResult<Admission> {
    let inserted = conn.execute(
        r#"
        INSERT INTO events (id, kind, message_id, chat_id, payload_json, timestamp, timestamp_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            event.id.as_str(),
            event.kind.as_str(),
            event.message_id.as_ref().map(|id| id.as_str()),
            event.chat_id,
            serde_json::to_string(&event.payload)?,
            to_text(&event.timestamp),
            event.timestamp.timestamp_millis(),
        ],
    )?;
    Ok(admission(inserted, event.id.as_str()))
}

/// Claim a message id by inserting the message row
///
/// On `Accept` the new row's rowid is `conn.last_insert_rowid()`.
pub fn claim_message(conn: &Connection, message: &Message) -> StorageResult<Admission> {
    let inserted = conn.execute(
        r#"
        INSERT INTO messages (id, chat_id, sender_id, sender_name, text, caption, attachments_json,
                              reply_to, forwarded_from, timestamp, timestamp_ms, edit_count,
                              edited_at, deleted_at, deleted_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            message.id.as_str(),
            message.chat_id,
            message.sender_id,
            message.sender_name,
            message.text,
            message.caption,
            serde_json::to_string(&message.attachments)?,
            message.reply_to.as_ref().map(|id| id.as_str()),
            message.forwarded_from,
            to_text(&message.timestamp),
            message.timestamp.timestamp_millis(),
            message.edit_count,
            message.edited_at.as_ref().map(to_text),
            message.deleted_at.as_ref().map(to_text),
            message.deleted_at.map(|ts| ts.timestamp_millis()),
        ],
    )?;
    Ok(admission(inserted, message.id.as_str()))
}

fn admission(inserted: usize, id: &str) -> Admission {
    if inserted == 1 {
        Admission::Accept
    } else {
        Admission::Reject {
            existing_id: id.to_string(),
        }
    }
}
