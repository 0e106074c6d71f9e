//! Audit recorder
//!
//! Writes go through the caller's transaction, so an entry exists exactly
//! when the mutation it describes was committed.

use super::rows::to_text;
use super::traits::{StorageError, StorageResult};
use crate::model::AuditLogEntry;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Append an entry
///
/// Any failure is reported as `AuditWrite`; the caller must abandon its
/// transaction.
pub fn record(conn: &Connection, entry: &AuditLogEntry) -> StorageResult<()> {
    let before = entry.before.as_ref().map(serde_json::to_string).transpose()?;
    let after = entry.after.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        r#"
        INSERT INTO audit_log (id, operation, actor, target_collection, target_id,
                               before_json, after_json, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            entry.id.to_string(),
            entry.operation.as_str(),
            entry.actor,
            entry.target_collection.as_str(),
            entry.target_id,
            before,
            after,
            to_text(&entry.timestamp),
        ],
    )
    .map_err(StorageError::AuditWrite)?;
    Ok(())
}

/// JSON snapshot of a record for the before/after columns
pub fn snapshot<T: Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}
