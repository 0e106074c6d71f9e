//! telecache: chat message ingestion and cache backend
//!
//! Receives inbound chat events (Telegram updates or a flat generic shape),
//! deduplicates and normalizes them, stores them in SQLite with a full-text
//! index, and serves search and history back out. Every mutation leaves an
//! entry in an append-only audit log.
//!
//! # Core Concepts
//!
//! - **Events**: one per inbound update, keyed by the source's event id.
//!   Resubmitting an event is a no-op.
//! - **Messages**: current state per message id. Edits replace content;
//!   deletions leave a tombstone that search skips by default.
//! - **Audit log**: exactly one entry per accepted event, written in the
//!   same transaction as the change it describes.
//!
//! # Example
//!
//! ```
//! use telecache::{normalize_str, Credentials, MessageStore, OpenStore, SqliteStore, WriteMode};
//!
//! let store = SqliteStore::open_in_memory(&Credentials::default()).unwrap();
//! let event = normalize_str(
//!     r#"{"id":"e1","chat_id":42,"text":"hello world","timestamp":"2024-01-01T00:00:00Z"}"#,
//! )
//! .unwrap();
//! assert!(store.put(&event, "docs", WriteMode::Normal).unwrap().is_applied());
//! ```

pub mod cancel;
pub mod config;
pub mod ingest;
pub mod mcp;
pub mod model;
pub mod normalize;
pub mod query;
pub mod storage;

pub use cancel::CancellationToken;
pub use config::{Config, ConfigError, Credentials, Role};
pub use ingest::{EventSource, IngestError, IngestOutcome, IngestPipeline, JsonLinesSource, RetryPolicy};
pub use model::{
    Attachment, AttachmentKind, AuditLogEntry, AuditOperation, ChatId, Collection, Event, EventId,
    EventKind, Message, MessageEdit, MessageId,
};
pub use normalize::{normalize, normalize_str, Change, MalformedEventError, NormalizedEvent};
pub use query::{QueryError, QueryService, SearchRequest};
pub use storage::{
    MessageStore, OpenStore, SearchFilter, SearchQuery, SqliteStore, StorageError, StorageResult,
    WriteMode, WriteOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open the configured store file, running migrations if the principal may
pub fn open_store(config: &Config) -> StorageResult<SqliteStore> {
    SqliteStore::open(config.store.resolved_path(), &config.store, &config.credentials)
}
