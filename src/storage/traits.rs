//! Storage trait definitions

use super::search::{SearchCursor, SearchQuery};
use crate::config::{Credentials, StoreConfig};
use crate::model::{AuditLogEntry, AuditOperation, ChatId, Collection, Event, EventId, Message, MessageId};
use crate::normalize::NormalizedEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A tombstoned message was targeted by a non-tombstone mutation
    #[error("Conflict on message {id}: {reason}")]
    Conflict { id: MessageId, reason: String },

    /// The event references a message the store has never seen
    #[error("Message not found: {0}")]
    MissingTarget(MessageId),

    /// Text index maintenance failed; the write was rolled back
    #[error("Text index update failed: {0}")]
    IndexUpdate(#[source] rusqlite::Error),

    /// The audit entry could not be written; the mutation was rolled back
    #[error("Audit write failed: {0}")]
    AuditWrite(#[source] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Timed out after {0:?} waiting for a store connection")]
    PoolTimeout(Duration),

    #[error("Principal '{principal}' lacks the {role} role")]
    PermissionDenied { principal: String, role: String },

    #[error("Invalid search query: {0}")]
    InvalidQuery(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Busy/locked databases, I/O failures, pool exhaustion and failed
    /// index or audit writes are transient. Conflicts, missing targets and
    /// bad input are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => is_transient_sqlite(e),
            Self::IndexUpdate(_) | Self::AuditWrite(_) | Self::Pool(_) | Self::PoolTimeout(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
        ),
        _ => false,
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// How `put` treats tombstoned messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Edits to a tombstoned message fail with `Conflict`
    #[default]
    Normal,
    /// Edits to a tombstoned message are applied and lift the tombstone
    Override,
}

/// Answer of the idempotency gate for one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject { existing_id: String },
}

/// Result of a `put`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// The event was new; the mutation and its audit entry were committed
    Applied {
        event_id: EventId,
        message_id: Option<MessageId>,
        operation: AuditOperation,
        audit_id: Uuid,
    },
    /// The identifier was already stored; nothing changed
    Duplicate {
        collection: Collection,
        existing_id: String,
    },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A message with its event history, read from one snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHistory {
    pub message: Message,
    /// Events referencing the message, oldest first
    pub events: Vec<Event>,
}

/// One search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub message: Message,
    /// Relevance score; lower ranks first (SQLite bm25 convention)
    pub score: f64,
}

/// A page of search results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// Present when more results follow this page
    pub next_cursor: Option<SearchCursor>,
}

/// Per-chat statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatStats {
    pub chat_id: ChatId,
    pub total_messages: u64,
    pub deleted_messages: u64,
    pub edited_messages: u64,
    /// Most active sender and their message count
    pub top_sender: Option<(i64, u64)>,
}

/// Whole-store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_messages: u64,
    pub active_messages: u64,
    pub deleted_messages: u64,
    pub edited_messages: u64,
    pub chats: u64,
    pub events: u64,
    pub audit_entries: u64,
    pub parked_events: u64,
}

/// A raw event set aside for manual replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParkedEvent {
    pub id: i64,
    /// Where the event came from (source name)
    pub source: String,
    pub raw: String,
    pub reason: String,
    pub attempts: u32,
    pub parked_at: DateTime<Utc>,
}

/// Trait for message store backends
///
/// Implementations must be thread-safe (Send + Sync): ingestion paths and
/// query handlers share one store.
pub trait MessageStore: Send + Sync {
    // === Writes ===

    /// Store a normalized event and apply its change
    ///
    /// Idempotent per event id. The event row, the message mutation, the
    /// text index update and the audit entry commit together or not at all.
    fn put(&self, record: &NormalizedEvent, actor: &str, mode: WriteMode) -> StorageResult<WriteOutcome>;

    // === Reads ===

    /// Current state of a message, tombstoned or not
    fn get(&self, id: &MessageId) -> StorageResult<Option<Message>>;

    /// A message and its events, read in one transaction
    fn history(&self, id: &MessageId) -> StorageResult<Option<MessageHistory>>;

    fn get_event(&self, id: &EventId) -> StorageResult<Option<Event>>;

    /// One page of full-text search results
    fn search(&self, query: &SearchQuery) -> StorageResult<SearchPage>;

    /// Most recent messages of a chat, newest first
    fn chat_messages(&self, chat_id: ChatId, limit: usize, include_deleted: bool) -> StorageResult<Vec<Message>>;

    /// Most recently tombstoned messages, newest deletion first
    fn deleted_messages(&self, chat_id: Option<ChatId>, limit: usize) -> StorageResult<Vec<Message>>;

    fn chat_stats(&self, chat_id: ChatId) -> StorageResult<ChatStats>;

    fn stats(&self) -> StorageResult<StoreStats>;

    /// Audit entries for a target id, oldest first
    fn audit_for(&self, target_id: &str) -> StorageResult<Vec<AuditLogEntry>>;

    /// All messages ordered by chat and time
    fn export(&self) -> StorageResult<Vec<Message>>;

    // === Parking ===

    /// Set a raw event aside for replay, returning its parking id
    fn park(&self, source: &str, raw: &str, reason: &str, attempts: u32) -> StorageResult<i64>;

    /// Parked events, oldest first
    fn parked(&self, limit: usize) -> StorageResult<Vec<ParkedEvent>>;

    /// Remove a parked event after a successful replay
    fn unpark(&self, id: i64) -> StorageResult<bool>;

    /// Record a failed replay on a parked event: replace its reason and
    /// add `attempts` to its count. Returns false if the entry is gone.
    fn requeue_parked(&self, id: i64, reason: &str, attempts: u32) -> StorageResult<bool>;
}

/// Extension trait for opening stores
pub trait OpenStore: MessageStore + Sized {
    /// Open or create a store at the given path, running pending migrations
    fn open(path: impl AsRef<Path>, config: &StoreConfig, credentials: &Credentials) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory(credentials: &Credentials) -> StorageResult<Self>;
}
