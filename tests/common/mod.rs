//! Common test utilities for telecache integration tests
//!
//! Builders for raw events in both dialects and helpers for opening
//! throwaway stores.

#![allow(dead_code)]

use std::sync::Arc;
use telecache::config::StoreConfig;
use telecache::{Credentials, IngestPipeline, MessageStore, OpenStore, RetryPolicy, SqliteStore};
use tempfile::TempDir;

/// A file-backed store in a temporary directory
///
/// The directory lives as long as this value.
pub struct TestStore {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
}

impl TestStore {
    pub fn open(pool_size: usize) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = StoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            pool_size,
            ..StoreConfig::default()
        };
        let store = SqliteStore::open(config.resolved_path(), &config, &Credentials::default())
            .expect("open store");
        Self {
            dir,
            store: Arc::new(store),
        }
    }

    pub fn shared(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }
}

pub fn memory_store() -> Arc<dyn MessageStore> {
    Arc::new(SqliteStore::open_in_memory(&Credentials::default()).expect("open in-memory store"))
}

/// Pipeline with millisecond backoff
pub fn pipeline(store: Arc<dyn MessageStore>) -> IngestPipeline {
    IngestPipeline::new(store, "integration").with_retry_policy(RetryPolicy {
        max_attempts: 5,
        initial_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(10),
    })
}

/// Generic-dialect new message
pub fn generic_message(id: &str, chat_id: i64, text: &str, timestamp: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "message",
        "chat_id": chat_id,
        "sender_id": 7,
        "text": text,
        "timestamp": timestamp,
    })
    .to_string()
}

pub fn generic_edit(id: &str, target: &str, text: &str, timestamp: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "edited",
        "message_id": target,
        "text": text,
        "timestamp": timestamp,
    })
    .to_string()
}

pub fn generic_delete(id: &str, target: &str, timestamp: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "deleted",
        "message_id": target,
        "timestamp": timestamp,
    })
    .to_string()
}

/// Telegram `Update` carrying a new text message
pub fn telegram_text(update_id: i64, chat_id: i64, message_id: i64, text: &str, date: i64) -> String {
    serde_json::json!({
        "update_id": update_id,
        "message": {
            "message_id": message_id,
            "date": date,
            "chat": {"id": chat_id, "type": "supergroup", "title": "test chat"},
            "from": {"id": 1001, "is_bot": false, "first_name": "Ada", "username": "ada"},
            "text": text,
        }
    })
    .to_string()
}
