//! Audit log entries
//!
//! One entry per accepted mutation, written in the same transaction as the
//! mutation it describes. Entries are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The mutation an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    MessageCreated,
    MessageEdited,
    MessageTombstoned,
    /// An edit applied to a tombstone under override, lifting the tombstone
    MessageRestored,
    /// An event that changed no message (reactions, membership, other)
    EventRecorded,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCreated => "message_created",
            Self::MessageEdited => "message_edited",
            Self::MessageTombstoned => "message_tombstoned",
            Self::MessageRestored => "message_restored",
            Self::EventRecorded => "event_recorded",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "message_created" => Some(Self::MessageCreated),
            "message_edited" => Some(Self::MessageEdited),
            "message_tombstoned" => Some(Self::MessageTombstoned),
            "message_restored" => Some(Self::MessageRestored),
            "event_recorded" => Some(Self::EventRecorded),
            _ => None,
        }
    }
}

/// Logical collection a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Messages,
    Events,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Events => "events",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "messages" => Some(Self::Messages),
            "events" => Some(Self::Events),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub operation: AuditOperation,
    pub actor: String,
    pub target_collection: Collection,
    pub target_id: String,
    /// Snapshot of the target before the mutation, if it existed
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        operation: AuditOperation,
        actor: impl Into<String>,
        target_collection: Collection,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            actor: actor.into(),
            target_collection,
            target_id: target_id.into(),
            before: None,
            after: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_snapshots(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}
