//! Bounded SQLite connection pool
//!
//! An `r2d2` pool over `r2d2_sqlite` connections. Each store operation
//! checks a connection out for its own duration; the `PooledConnection`
//! guard hands it back on drop, so every exit path (including `?` and
//! panics unwinding through the operation) releases it.

use super::traits::{StorageError, StorageResult};
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

/// A checked-out connection; returned to the pool on drop
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

pub struct ConnectionPool {
    inner: r2d2::Pool<SqliteConnectionManager>,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Open `size` connections through `manager`
    ///
    /// Connections are never recycled for age or idleness: an in-memory
    /// database lives exactly as long as its connection.
    pub fn new(manager: SqliteConnectionManager, size: usize, acquire_timeout: Duration) -> StorageResult<Self> {
        let acquire_timeout = acquire_timeout.max(Duration::from_millis(1));
        let inner = r2d2::Pool::builder()
            .max_size(u32::try_from(size.max(1)).unwrap_or(u32::MAX))
            .connection_timeout(acquire_timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Ok(Self {
            inner,
            acquire_timeout,
        })
    }

    /// Total number of connections, checked out or idle
    pub fn size(&self) -> usize {
        self.inner.max_size() as usize
    }

    /// Number of connections currently idle
    pub fn idle(&self) -> usize {
        self.inner.state().idle_connections as usize
    }

    /// Check out a connection, waiting up to the acquire timeout
    pub fn acquire(&self) -> StorageResult<PooledConnection> {
        self.inner.get().map_err(|e| {
            tracing::warn!(error = %e, timeout = ?self.acquire_timeout, "no store connection available");
            StorageError::PoolTimeout(self.acquire_timeout)
        })
    }
}
