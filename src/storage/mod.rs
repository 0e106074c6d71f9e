//! Storage backends for telecache
//!
//! The store is reached through the `MessageStore` trait. The shipped
//! implementation is `SqliteStore`: messages, events, the audit log and the
//! full-text index live in one SQLite database.

pub mod audit;
pub mod dedup;
mod pool;
mod rows;
pub mod schema;
pub mod search;
mod sqlite;
mod traits;

pub use pool::{ConnectionPool, PooledConnection};
pub use search::{SearchCursor, SearchFilter, SearchQuery, SearchResults};
pub use sqlite::SqliteStore;
pub use traits::{
    Admission, ChatStats, MessageHistory, MessageStore, OpenStore, ParkedEvent, SearchHit, SearchPage,
    StorageError, StorageResult, StoreStats, WriteMode, WriteOutcome,
};
