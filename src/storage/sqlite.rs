//! SQLite storage backend
//!
//! One database file holds the `messages`, `events`, `audit_log` and
//! `parked_events` tables plus the `messages_fts` text index. Connections
//! come from a bounded pool; every write is a single `BEGIN IMMEDIATE`
//! transaction covering the event claim, the message mutation, the index
//! update and the audit entry.

use super::audit::{self, snapshot};
use super::dedup;
use super::pool::ConnectionPool;
use super::rows::{
    self, AuditRow, EventRow, MessageRow, AUDIT_COLUMNS, EVENT_COLUMNS, MESSAGE_COLUMNS,
    PARKED_COLUMNS,
};
use super::schema;
use super::search::{self, SearchQuery};
use super::traits::{
    Admission, ChatStats, MessageHistory, MessageStore, OpenStore, ParkedEvent, SearchPage,
    StorageError, StorageResult, StoreStats, WriteMode, WriteOutcome,
};
use crate::config::{Credentials, Role, StoreConfig};
use crate::model::{
    AuditLogEntry, AuditOperation, ChatId, Collection, Event, EventId, Message, MessageEdit,
    MessageId,
};
use crate::normalize::{Change, NormalizedEvent};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// A committed change, before its audit entry is written
struct Mutation {
    operation: AuditOperation,
    collection: Collection,
    target_id: String,
    message_id: Option<MessageId>,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
}

enum Step {
    Mutated(Mutation),
    /// The message already exists under this id
    AlreadyStored(String),
}

/// SQLite-backed message store
///
/// Thread-safe: each operation checks a connection out of the pool.
pub struct SqliteStore {
    pool: ConnectionPool,
    credentials: Credentials,
}

impl SqliteStore {
    /// Per-connection setup, run by the pool for every connection it opens
    fn configure(conn: &mut Connection, busy_timeout: Duration, file_backed: bool) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if file_backed {
            // WAL lets readers proceed while a writer holds the lock
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        }
        Ok(())
    }

    /// Run pending migrations on `conn`, which requires the db_admin role
    fn init_schema(conn: &mut Connection, credentials: &Credentials) -> StorageResult<()> {
        if schema::current_version(conn)? < schema::latest_version() {
            if !credentials.has(Role::DbAdmin) {
                return Err(StorageError::PermissionDenied {
                    principal: credentials.principal.clone(),
                    role: Role::DbAdmin.to_string(),
                });
            }
            schema::migrate(conn)?;
        }
        Ok(())
    }

    fn require(&self, role: Role) -> StorageResult<()> {
        if self.credentials.has(role) {
            Ok(())
        } else {
            Err(StorageError::PermissionDenied {
                principal: self.credentials.principal.clone(),
                role: role.to_string(),
            })
        }
    }

    /// The principal this store was opened with
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn schema_version(&self) -> StorageResult<u32> {
        let conn = self.pool.acquire()?;
        schema::current_version(&conn)
    }

    // === Write steps (all run inside the put transaction) ===

    fn load_message(conn: &Connection, id: &MessageId) -> StorageResult<Option<(i64, Message)>> {
        let row = conn
            .query_row(
                &format!("SELECT rowid, {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, MessageRow::read(row, 1)?)),
            )
            .optional()?;
        match row {
            Some((rowid, message_row)) => Ok(Some((rowid, message_row.into_message()?))),
            None => Ok(None),
        }
    }

    fn message_exists(conn: &Connection, id: &MessageId) -> StorageResult<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn update_message_row(conn: &Connection, rowid: i64, message: &Message) -> StorageResult<()> {
        conn.execute(
            r#"
            UPDATE messages SET
                sender_id = ?2,
                text = ?3,
                caption = ?4,
                attachments_json = ?5,
                edit_count = ?6,
                edited_at = ?7,
                deleted_at = ?8,
                deleted_at_ms = ?9
            WHERE rowid = ?1
            "#,
            params![
                rowid,
                message.sender_id,
                message.text,
                message.caption,
                serde_json::to_string(&message.attachments)?,
                message.edit_count,
                message.edited_at.as_ref().map(rows::to_text),
                message.deleted_at.as_ref().map(rows::to_text),
                message.deleted_at.map(|ts| ts.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn insert_message(conn: &Connection, message: &Message) -> StorageResult<Step> {
        if let Admission::Reject { existing_id } = dedup::claim_message(conn, message)? {
            return Ok(Step::AlreadyStored(existing_id));
        }
        let rowid = conn.last_insert_rowid();
        search::index_insert(conn, rowid, message)?;
        Ok(Step::Mutated(Mutation {
            operation: AuditOperation::MessageCreated,
            collection: Collection::Messages,
            target_id: message.id.to_string(),
            message_id: Some(message.id.clone()),
            before: None,
            after: Some(snapshot(message)?),
        }))
    }

    fn edit_message(
        conn: &Connection,
        edit: &MessageEdit,
        event_time: DateTime<Utc>,
        mode: WriteMode,
    ) -> StorageResult<Step> {
        let Some((rowid, current)) = Self::load_message(conn, &edit.target)? else {
            // Edit of a message we never saw: first sighting, if it can be placed
            let message = edit
                .to_first_seen(event_time)
                .ok_or_else(|| StorageError::MissingTarget(edit.target.clone()))?;
            return Self::insert_message(conn, &message);
        };

        let restoring = current.is_tombstoned();
        if restoring && mode == WriteMode::Normal {
            return Err(StorageError::Conflict {
                id: current.id.clone(),
                reason: "message is tombstoned; edits need an explicit override".into(),
            });
        }

        let mut updated = current.clone();
        updated.apply_edit(edit);
        if restoring {
            updated.deleted_at = None;
        }
        Self::update_message_row(conn, rowid, &updated)?;
        search::index_update(conn, rowid, &updated)?;

        Ok(Step::Mutated(Mutation {
            operation: if restoring {
                AuditOperation::MessageRestored
            } else {
                AuditOperation::MessageEdited
            },
            collection: Collection::Messages,
            target_id: updated.id.to_string(),
            message_id: Some(updated.id.clone()),
            before: Some(snapshot(&current)?),
            after: Some(snapshot(&updated)?),
        }))
    }

    fn tombstone_message(conn: &Connection, id: &MessageId, event_time: DateTime<Utc>) -> StorageResult<Step> {
        let Some((rowid, current)) = Self::load_message(conn, id)? else {
            return Err(StorageError::MissingTarget(id.clone()));
        };
        let mut updated = current.clone();
        // The first deletion wins; repeats are recorded but keep its time
        if updated.deleted_at.is_none() {
            updated.deleted_at = Some(event_time);
        }
        // Tombstones stay in the text index; queries filter them
        Self::update_message_row(conn, rowid, &updated)?;

        Ok(Step::Mutated(Mutation {
            operation: AuditOperation::MessageTombstoned,
            collection: Collection::Messages,
            target_id: id.to_string(),
            message_id: Some(id.clone()),
            before: Some(snapshot(&current)?),
            after: Some(snapshot(&updated)?),
        }))
    }

    fn record_event(conn: &Connection, event: &Event) -> StorageResult<Step> {
        if let Some(message_id) = &event.message_id {
            if !Self::message_exists(conn, message_id)? {
                return Err(StorageError::MissingTarget(message_id.clone()));
            }
        }
        Ok(Step::Mutated(Mutation {
            operation: AuditOperation::EventRecorded,
            collection: Collection::Events,
            target_id: event.id.to_string(),
            message_id: event.message_id.clone(),
            before: None,
            after: Some(snapshot(event)?),
        }))
    }

    fn query_messages(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<Message>> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| MessageRow::read(row, 0))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        Ok(messages)
    }

    fn count(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> StorageResult<u64> {
        let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>, config: &StoreConfig, credentials: &Credentials) -> StorageResult<Self> {
        let path = path.as_ref();
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Migrate on a direct connection first so open errors surface
        // immediately instead of as a pool timeout
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let mut first = Connection::open(path)?;
        Self::configure(&mut first, busy_timeout, true)?;
        Self::init_schema(&mut first, credentials)?;
        drop(first);

        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| Self::configure(conn, busy_timeout, true));
        let pool = ConnectionPool::new(
            manager,
            config.pool_size,
            Duration::from_millis(config.acquire_timeout_ms),
        )?;

        tracing::debug!(
            path = %path.display(),
            pool_size = pool.size(),
            principal = %credentials.principal,
            "opened message store"
        );

        Ok(Self {
            pool,
            credentials: credentials.clone(),
        })
    }

    fn open_in_memory(credentials: &Credentials) -> StorageResult<Self> {
        // Each in-memory connection is its own database, so the pool holds one
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| Self::configure(conn, Duration::from_secs(5), false));
        let pool = ConnectionPool::new(manager, 1, Duration::from_secs(30))?;
        {
            let mut conn = pool.acquire()?;
            Self::init_schema(&mut conn, credentials)?;
        }

        Ok(Self {
            pool,
            credentials: credentials.clone(),
        })
    }
}

impl MessageStore for SqliteStore {
    // === Writes ===

    fn put(&self, record: &NormalizedEvent, actor: &str, mode: WriteMode) -> StorageResult<WriteOutcome> {
        self.require(Role::ReadWrite)?;
        let mut conn = self.pool.acquire()?;
        // IMMEDIATE takes the write lock up front so the busy timeout applies
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Admission::Reject { existing_id } = dedup::claim_event(&tx, &record.event)? {
            return Ok(WriteOutcome::Duplicate {
                collection: Collection::Events,
                existing_id,
            });
        }

        let step = match &record.change {
            Change::Create(message) => Self::insert_message(&tx, message)?,
            Change::Edit(edit) => Self::edit_message(&tx, edit, record.event.timestamp, mode)?,
            Change::Tombstone(id) => Self::tombstone_message(&tx, id, record.event.timestamp)?,
            Change::Record => Self::record_event(&tx, &record.event)?,
        };
        let mutation = match step {
            Step::Mutated(mutation) => mutation,
            // Dropping the transaction releases the event claim too
            Step::AlreadyStored(existing_id) => {
                return Ok(WriteOutcome::Duplicate {
                    collection: Collection::Messages,
                    existing_id,
                })
            }
        };

        let entry = AuditLogEntry::new(
            mutation.operation,
            actor,
            mutation.collection,
            mutation.target_id,
        )
        .with_snapshots(mutation.before, mutation.after);
        audit::record(&tx, &entry)?;
        tx.commit()?;

        Ok(WriteOutcome::Applied {
            event_id: record.event.id.clone(),
            message_id: mutation.message_id,
            operation: entry.operation,
            audit_id: entry.id,
        })
    }

    // === Reads ===

    fn get(&self, id: &MessageId) -> StorageResult<Option<Message>> {
        let conn = self.pool.acquire()?;
        Ok(Self::load_message(&conn, id)?.map(|(_, message)| message))
    }

    fn history(&self, id: &MessageId) -> StorageResult<Option<MessageHistory>> {
        let mut conn = self.pool.acquire()?;
        // One read transaction: the message and its events come from the same snapshot
        let tx = conn.transaction()?;
        let Some((_, message)) = Self::load_message(&tx, id)? else {
            return Ok(None);
        };

        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM events WHERE message_id = ?1 ORDER BY timestamp_ms, rowid",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![id.as_str()], EventRow::read)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        drop(stmt);
        tx.commit()?;

        Ok(Some(MessageHistory { message, events }))
    }

    fn get_event(&self, id: &EventId) -> StorageResult<Option<Event>> {
        let conn = self.pool.acquire()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id.as_str()],
                EventRow::read,
            )
            .optional()?;
        row.map(EventRow::into_event).transpose()
    }

    fn search(&self, query: &SearchQuery) -> StorageResult<SearchPage> {
        let conn = self.pool.acquire()?;
        let (hits, has_more) = search::search_page(&conn, query)?;
        let next_cursor = search::next_cursor(&hits, has_more);
        Ok(SearchPage { hits, next_cursor })
    }

    fn chat_messages(&self, chat_id: ChatId, limit: usize, include_deleted: bool) -> StorageResult<Vec<Message>> {
        let filter = if include_deleted { "" } else { " AND deleted_at IS NULL" };
        let sql = format!(
            "SELECT {} FROM messages WHERE chat_id = ?1{} ORDER BY timestamp_ms DESC, id DESC LIMIT ?2",
            MESSAGE_COLUMNS, filter
        );
        self.query_messages(&sql, params![chat_id, limit as i64])
    }

    fn deleted_messages(&self, chat_id: Option<ChatId>, limit: usize) -> StorageResult<Vec<Message>> {
        match chat_id {
            Some(chat_id) => self.query_messages(
                &format!(
                    "SELECT {} FROM messages WHERE deleted_at_ms IS NOT NULL AND chat_id = ?1 \
                     ORDER BY deleted_at_ms DESC, id ASC LIMIT ?2",
                    MESSAGE_COLUMNS
                ),
                params![chat_id, limit as i64],
            ),
            None => self.query_messages(
                &format!(
                    "SELECT {} FROM messages WHERE deleted_at_ms IS NOT NULL \
                     ORDER BY deleted_at_ms DESC, id ASC LIMIT ?1",
                    MESSAGE_COLUMNS
                ),
                params![limit as i64],
            ),
        }
    }

    fn chat_stats(&self, chat_id: ChatId) -> StorageResult<ChatStats> {
        let conn = self.pool.acquire()?;
        let (total, deleted, edited): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(deleted_at IS NOT NULL), 0),
                   COALESCE(SUM(edit_count > 0), 0)
            FROM messages WHERE chat_id = ?1
            "#,
            params![chat_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let top_sender: Option<(i64, i64)> = conn
            .query_row(
                r#"
                SELECT sender_id, COUNT(*) AS n FROM messages
                WHERE chat_id = ?1 AND sender_id IS NOT NULL
                GROUP BY sender_id
                ORDER BY n DESC, sender_id ASC
                LIMIT 1
                "#,
                params![chat_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(ChatStats {
            chat_id,
            total_messages: total as u64,
            deleted_messages: deleted as u64,
            edited_messages: edited as u64,
            top_sender: top_sender.map(|(sender, n)| (sender, n as u64)),
        })
    }

    fn stats(&self) -> StorageResult<StoreStats> {
        let conn = self.pool.acquire()?;
        let total = Self::count(&conn, "SELECT COUNT(*) FROM messages", &[])?;
        let deleted = Self::count(&conn, "SELECT COUNT(*) FROM messages WHERE deleted_at IS NOT NULL", &[])?;
        Ok(StoreStats {
            total_messages: total,
            active_messages: total - deleted,
            deleted_messages: deleted,
            edited_messages: Self::count(&conn, "SELECT COUNT(*) FROM messages WHERE edit_count > 0", &[])?,
            chats: Self::count(&conn, "SELECT COUNT(DISTINCT chat_id) FROM messages", &[])?,
            events: Self::count(&conn, "SELECT COUNT(*) FROM events", &[])?,
            audit_entries: Self::count(&conn, "SELECT COUNT(*) FROM audit_log", &[])?,
            parked_events: Self::count(&conn, "SELECT COUNT(*) FROM parked_events", &[])?,
        })
    }

    fn audit_for(&self, target_id: &str) -> StorageResult<Vec<AuditLogEntry>> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE target_id = ?1 ORDER BY rowid",
            AUDIT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![target_id], AuditRow::read)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn export(&self) -> StorageResult<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages ORDER BY chat_id, timestamp_ms, id",
                MESSAGE_COLUMNS
            ),
            &[],
        )
    }

    // === Parking ===

    fn park(&self, source: &str, raw: &str, reason: &str, attempts: u32) -> StorageResult<i64> {
        self.require(Role::ReadWrite)?;
        let conn = self.pool.acquire()?;
        conn.execute(
            "INSERT INTO parked_events (source, raw, reason, attempts, parked_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source, raw, reason, attempts, rows::to_text(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn parked(&self, limit: usize) -> StorageResult<Vec<ParkedEvent>> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM parked_events ORDER BY id LIMIT ?1",
            PARKED_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], rows::read_parked)?;
        let mut parked = Vec::new();
        for row in rows {
            parked.push(rows::into_parked(row?)?);
        }
        Ok(parked)
    }

    fn unpark(&self, id: i64) -> StorageResult<bool> {
        self.require(Role::ReadWrite)?;
        let conn = self.pool.acquire()?;
        let removed = conn.execute("DELETE FROM parked_events WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn requeue_parked(&self, id: i64, reason: &str, attempts: u32) -> StorageResult<bool> {
        self.require(Role::ReadWrite)?;
        let conn = self.pool.acquire()?;
        let updated = conn.execute(
            "UPDATE parked_events SET reason = ?2, attempts = attempts + ?3 WHERE id = ?1",
            params![id, reason, attempts],
        )?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, MessageEdit};
    use crate::storage::search::SearchFilter;
    use chrono::TimeZone;

    const ACTOR: &str = "test";

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory(&Credentials::default()).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn create(event_id: &str, message_id: &str, chat_id: ChatId, text: &str, secs: i64) -> NormalizedEvent {
        let message = Message::new(message_id, chat_id, ts(secs)).with_text(text).with_sender(7);
        NormalizedEvent {
            event: Event::new(event_id, EventKind::Created, ts(secs))
                .for_message(message_id)
                .in_chat(chat_id),
            change: Change::Create(message),
        }
    }

    fn edit(event_id: &str, target: &str, text: &str, secs: i64) -> NormalizedEvent {
        NormalizedEvent {
            event: Event::new(event_id, EventKind::Edited, ts(secs)).for_message(target),
            change: Change::Edit(MessageEdit {
                target: target.into(),
                chat_id: None,
                sender_id: None,
                text: Some(text.into()),
                caption: None,
                attachments: None,
                edited_at: ts(secs),
                original_timestamp: None,
            }),
        }
    }

    fn delete(event_id: &str, target: &str, secs: i64) -> NormalizedEvent {
        NormalizedEvent {
            event: Event::new(event_id, EventKind::Deleted, ts(secs)).for_message(target),
            change: Change::Tombstone(target.into()),
        }
    }

    fn search_ids(store: &SqliteStore, text: &str, filter: SearchFilter) -> Vec<String> {
        store
            .search(&SearchQuery::new(text, 50).with_filter(filter))
            .unwrap()
            .hits
            .into_iter()
            .map(|h| h.message.id.to_string())
            .collect()
    }

    fn raw_execute(store: &SqliteStore, sql: &str) {
        let conn = store.pool.acquire().unwrap();
        conn.execute_batch(sql).unwrap();
    }

    #[test]
    fn test_put_and_get_message() {
        let store = create_test_store();
        let outcome = store
            .put(&create("e1", "e1", 42, "hello world", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Applied {
                operation: AuditOperation::MessageCreated,
                ..
            }
        ));

        let msg = store.get(&"e1".into()).unwrap().unwrap();
        assert_eq!(msg.chat_id, 42);
        assert_eq!(msg.text.as_deref(), Some("hello world"));
        assert_eq!(msg.timestamp, ts(100));
        assert!(store.get(&"missing".into()).unwrap().is_none());
    }

    #[test]
    fn test_resubmitted_event_is_a_no_op() {
        let store = create_test_store();
        let record = create("e1", "e1", 42, "hello world", 100);
        store.put(&record, ACTOR, WriteMode::Normal).unwrap();
        let before = store.stats().unwrap();

        let outcome = store.put(&record, ACTOR, WriteMode::Normal).unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Duplicate {
                collection: Collection::Events,
                existing_id: "e1".into()
            }
        );
        assert_eq!(store.stats().unwrap(), before);
        assert_eq!(store.audit_for("e1").unwrap().len(), 1);
    }

    #[test]
    fn test_same_message_under_new_event_id_is_rejected_whole() {
        let store = create_test_store();
        store
            .put(&create("u1", "m1", 1, "first", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        let outcome = store
            .put(&create("u2", "m1", 1, "second", 101), ACTOR, WriteMode::Normal)
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Duplicate {
                collection: Collection::Messages,
                existing_id: "m1".into()
            }
        );
        // The second event's claim was rolled back with the rest
        assert!(store.get_event(&"u2".into()).unwrap().is_none());
        assert_eq!(store.get(&"m1".into()).unwrap().unwrap().text.as_deref(), Some("first"));
        assert_eq!(store.stats().unwrap().audit_entries, 1);
    }

    #[test]
    fn test_edit_updates_message_and_index() {
        let store = create_test_store();
        store
            .put(&create("e1", "m1", 1, "draft version", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store
            .put(&edit("e2", "m1", "final version", 110), ACTOR, WriteMode::Normal)
            .unwrap();

        let msg = store.get(&"m1".into()).unwrap().unwrap();
        assert_eq!(msg.edit_count, 1);
        assert_eq!(msg.edited_at, Some(ts(110)));
        assert_eq!(search_ids(&store, "final", SearchFilter::new()), vec!["m1"]);
        assert!(search_ids(&store, "draft", SearchFilter::new()).is_empty());

        let audit = store.audit_for("m1").unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].operation, AuditOperation::MessageEdited);
        assert_eq!(audit[1].before.as_ref().unwrap()["text"], "draft version");
        assert_eq!(audit[1].after.as_ref().unwrap()["text"], "final version");
    }

    #[test]
    fn test_edit_of_unknown_message() {
        let store = create_test_store();
        let err = store
            .put(&edit("e1", "ghost", "boo", 100), ACTOR, WriteMode::Normal)
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingTarget(_)));
        assert!(!err.is_transient());
        assert_eq!(store.stats().unwrap().events, 0);

        // With a chat the edit is the first sighting
        let mut first_seen = edit("e2", "late", "arrived edited", 100);
        if let Change::Edit(e) = &mut first_seen.change {
            e.chat_id = Some(5);
        }
        let outcome = store.put(&first_seen, ACTOR, WriteMode::Normal).unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Applied {
                operation: AuditOperation::MessageCreated,
                ..
            }
        ));
        let msg = store.get(&"late".into()).unwrap().unwrap();
        assert_eq!(msg.chat_id, 5);
        assert_eq!(msg.edit_count, 1);
    }

    #[test]
    fn test_tombstone_hides_from_search_but_keeps_record() {
        let store = create_test_store();
        store
            .put(&create("e1", "m1", 1, "secret plans", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store.put(&delete("e2", "m1", 120), ACTOR, WriteMode::Normal).unwrap();

        let msg = store.get(&"m1".into()).unwrap().unwrap();
        assert_eq!(msg.deleted_at, Some(ts(120)));
        assert!(search_ids(&store, "secret", SearchFilter::new()).is_empty());
        assert_eq!(
            search_ids(&store, "secret", SearchFilter::new().including_deleted()),
            vec!["m1"]
        );

        let audit = store.audit_for("m1").unwrap();
        assert_eq!(
            audit.iter().map(|e| e.operation).collect::<Vec<_>>(),
            vec![AuditOperation::MessageCreated, AuditOperation::MessageTombstoned]
        );
        assert_eq!(store.deleted_messages(Some(1), 10).unwrap().len(), 1);
        assert_eq!(store.deleted_messages(Some(2), 10).unwrap().len(), 0);
    }

    #[test]
    fn test_repeated_delete_keeps_first_deletion_time() {
        let store = create_test_store();
        store
            .put(&create("e1", "m1", 1, "x", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store.put(&delete("e2", "m1", 120), ACTOR, WriteMode::Normal).unwrap();
        store.put(&delete("e3", "m1", 130), ACTOR, WriteMode::Normal).unwrap();
        let msg = store.get(&"m1".into()).unwrap().unwrap();
        assert_eq!(msg.deleted_at, Some(ts(120)));
        assert_eq!(store.audit_for("m1").unwrap().len(), 3);
    }

    #[test]
    fn test_edit_of_tombstone_conflicts_without_override() {
        let store = create_test_store();
        store
            .put(&create("e1", "m1", 1, "original", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store.put(&delete("e2", "m1", 110), ACTOR, WriteMode::Normal).unwrap();

        let err = store
            .put(&edit("e3", "m1", "sneaky", 120), ACTOR, WriteMode::Normal)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert!(!err.is_transient());
        // Nothing from the rejected edit was kept
        assert!(store.get_event(&"e3".into()).unwrap().is_none());
        assert_eq!(store.audit_for("m1").unwrap().len(), 2);

        let outcome = store
            .put(&edit("e3", "m1", "restored text", 120), ACTOR, WriteMode::Override)
            .unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Applied {
                operation: AuditOperation::MessageRestored,
                ..
            }
        ));
        let msg = store.get(&"m1".into()).unwrap().unwrap();
        assert!(!msg.is_tombstoned());
        assert_eq!(search_ids(&store, "restored", SearchFilter::new()), vec!["m1"]);
    }

    #[test]
    fn test_reaction_needs_existing_message() {
        let store = create_test_store();
        let reaction = NormalizedEvent {
            event: Event::new("r1", EventKind::Reacted, ts(100)).for_message("m1"),
            change: Change::Record,
        };
        assert!(matches!(
            store.put(&reaction, ACTOR, WriteMode::Normal),
            Err(StorageError::MissingTarget(_))
        ));

        store
            .put(&create("e1", "m1", 1, "x", 90), ACTOR, WriteMode::Normal)
            .unwrap();
        let outcome = store.put(&reaction, ACTOR, WriteMode::Normal).unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Applied {
                operation: AuditOperation::EventRecorded,
                ..
            }
        ));
        let history = store.history(&"m1".into()).unwrap().unwrap();
        assert_eq!(
            history.events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "r1"]
        );
        assert_eq!(store.audit_for("r1").unwrap().len(), 1);
    }

    #[test]
    fn test_system_event_is_self_contained() {
        let store = create_test_store();
        let left = NormalizedEvent {
            event: Event::new("s1", EventKind::MemberLeft, ts(100))
                .in_chat(3)
                .with_payload(serde_json::json!({"id": 55})),
            change: Change::Record,
        };
        store.put(&left, ACTOR, WriteMode::Normal).unwrap();
        let stored = store.get_event(&"s1".into()).unwrap().unwrap();
        assert_eq!(stored, left.event);
    }

    #[test]
    fn test_index_failure_rolls_back_the_write() {
        let store = create_test_store();
        raw_execute(&store, "DROP TABLE messages_fts;");

        let err = store
            .put(&create("e1", "m1", 1, "hello", 100), ACTOR, WriteMode::Normal)
            .unwrap_err();
        assert!(matches!(err, StorageError::IndexUpdate(_)));
        assert!(err.is_transient());
        assert!(store.get(&"m1".into()).unwrap().is_none());
        assert!(store.get_event(&"e1".into()).unwrap().is_none());
        assert_eq!(store.stats().unwrap().audit_entries, 0);
    }

    #[test]
    fn test_audit_failure_rolls_back_the_mutation() {
        let store = create_test_store();
        raw_execute(&store, "DROP TABLE audit_log;");

        let err = store
            .put(&create("e1", "m1", 1, "hello", 100), ACTOR, WriteMode::Normal)
            .unwrap_err();
        assert!(matches!(err, StorageError::AuditWrite(_)));
        assert!(err.is_transient());
        assert!(store.get(&"m1".into()).unwrap().is_none());
        assert!(store.get_event(&"e1".into()).unwrap().is_none());
    }

    #[test]
    fn test_read_only_principal_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_cache.db");
        let config = StoreConfig::default();
        SqliteStore::open(&path, &config, &Credentials::default()).unwrap();

        let reader = SqliteStore::open(&path, &config, &Credentials::read_only("viewer")).unwrap();
        let err = reader
            .put(&create("e1", "m1", 1, "x", 1), ACTOR, WriteMode::Normal)
            .unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(reader.stats().is_ok());
    }

    #[test]
    fn test_migrations_require_db_admin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        let writer = Credentials::new("writer", vec![Role::ReadWrite]);
        let err = SqliteStore::open(&path, &StoreConfig::default(), &writer).err().unwrap();
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
    }

    #[test]
    fn test_ranking_breaks_ties_by_newer_timestamp() {
        let store = create_test_store();
        store
            .put(&create("e1", "old", 1, "hello world", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store
            .put(&create("e2", "new", 1, "hello world", 200), ACTOR, WriteMode::Normal)
            .unwrap();
        store
            .put(&create("e3", "best", 1, "hello hello hello", 50), ACTOR, WriteMode::Normal)
            .unwrap();

        let ids = search_ids(&store, "hello", SearchFilter::new());
        assert_eq!(ids, vec!["best", "new", "old"]);
        // Same snapshot, same order
        assert_eq!(search_ids(&store, "hello", SearchFilter::new()), ids);
    }

    #[test]
    fn test_search_matches_caption_and_filters() {
        let store = create_test_store();
        let mut photo = create("e1", "m1", 1, "", 100);
        if let Change::Create(m) = &mut photo.change {
            m.text = None;
            m.caption = Some("sunset over the bay".into());
        }
        store.put(&photo, ACTOR, WriteMode::Normal).unwrap();
        store
            .put(&create("e2", "m2", 2, "sunset tomorrow?", 200), ACTOR, WriteMode::Normal)
            .unwrap();

        assert_eq!(search_ids(&store, "sunset", SearchFilter::new()).len(), 2);
        assert_eq!(search_ids(&store, "sunset", SearchFilter::new().in_chat(1)), vec!["m1"]);
        assert_eq!(
            search_ids(&store, "sunset", SearchFilter::new().between(Some(ts(150)), None)),
            vec!["m2"]
        );
        assert_eq!(
            search_ids(&store, "sunset", SearchFilter::new().between(None, Some(ts(150)))),
            vec!["m1"]
        );
        assert_eq!(search_ids(&store, "suns", SearchFilter::new()).len(), 2);
    }

    #[test]
    fn test_search_matches_any_substring() {
        let store = create_test_store();
        store
            .put(&create("e1", "spaced", 1, "hello world", 100), ACTOR, WriteMode::Normal)
            .unwrap();
        store
            .put(&create("e2", "joined", 1, "HelloWorld", 200), ACTOR, WriteMode::Normal)
            .unwrap();
        let sorted = |text: &str| {
            let mut ids = search_ids(&store, text, SearchFilter::new());
            ids.sort();
            ids
        };

        assert_eq!(sorted("ello"), vec!["joined", "spaced"]);
        assert_eq!(sorted("world"), vec!["joined", "spaced"]);
        assert_eq!(sorted("lo wo"), vec!["spaced"]);
        assert_eq!(sorted("OWOR"), vec!["joined"]);
        // Below trigram length the store scans instead
        assert_eq!(sorted("ld"), vec!["joined", "spaced"]);
        assert_eq!(sorted("o w"), vec!["spaced"]);
        assert!(sorted("worlds").is_empty());
    }

    #[test]
    fn test_short_query_respects_filters_and_pages() {
        let store = create_test_store();
        for i in 0..3 {
            store
                .put(
                    &create(&format!("e{}", i), &format!("m{}", i), 1, "ok", 100 + i),
                    ACTOR,
                    WriteMode::Normal,
                )
                .unwrap();
        }
        store
            .put(&create("e9", "other", 2, "ok", 500), ACTOR, WriteMode::Normal)
            .unwrap();
        store.put(&delete("d1", "m0", 600), ACTOR, WriteMode::Normal).unwrap();

        assert_eq!(search_ids(&store, "OK", SearchFilter::new().in_chat(1)), vec!["m2", "m1"]);

        let first = store.search(&SearchQuery::new("ok", 2)).unwrap();
        assert_eq!(first.hits.len(), 2);
        let rest = store
            .search(&SearchQuery::new("ok", 2).after(first.next_cursor.clone()))
            .unwrap();
        assert_eq!(rest.hits.len(), 1);
        assert!(rest.next_cursor.is_none());
    }

    #[test]
    fn test_search_pages_follow_cursor() {
        let store = create_test_store();
        for i in 0..5 {
            store
                .put(
                    &create(&format!("e{}", i), &format!("m{}", i), 1, "status update", 100 + i),
                    ACTOR,
                    WriteMode::Normal,
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let page = store
                .search(&SearchQuery::new("status", 2).after(cursor.clone()))
                .unwrap();
            pages += 1;
            seen.extend(page.hits.iter().map(|h| h.message.id.to_string()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, vec!["m4", "m3", "m2", "m1", "m0"]);
    }

    #[test]
    fn test_cursor_pages_match_one_big_page_when_nothing_changes() {
        let store = create_test_store();
        let texts = [
            "deploy",
            "deploy deploy",
            "deploy notes for friday",
            "deploy deploy deploy",
            "rollback after deploy",
            "deploy",
        ];
        for (i, text) in texts.iter().enumerate() {
            store
                .put(
                    &create(&format!("e{}", i), &format!("m{}", i), 1, text, 100 + i as i64),
                    ACTOR,
                    WriteMode::Normal,
                )
                .unwrap();
        }
        let whole = search_ids(&store, "deploy", SearchFilter::new());
        assert_eq!(whole.len(), texts.len());

        let mut paged = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .search(&SearchQuery::new("deploy", 2).after(cursor.take()))
                .unwrap();
            paged.extend(page.hits.iter().map(|h| h.message.id.to_string()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(paged, whole);
    }

    #[test]
    fn test_empty_search_text_is_invalid() {
        let store = create_test_store();
        let err = store.search(&SearchQuery::new(" \t  ", 10)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[test]
    fn test_chat_stats_and_listing() {
        let store = create_test_store();
        let mut other_sender = create("e3", "m3", 1, "c", 103);
        if let Change::Create(m) = &mut other_sender.change {
            m.sender_id = Some(9);
        }
        for record in [
            create("e1", "m1", 1, "a", 101),
            create("e2", "m2", 1, "b", 102),
            other_sender,
            create("e4", "m4", 2, "elsewhere", 104),
        ] {
            store.put(&record, ACTOR, WriteMode::Normal).unwrap();
        }
        store.put(&edit("e5", "m1", "a2", 110), ACTOR, WriteMode::Normal).unwrap();
        store.put(&delete("e6", "m2", 111), ACTOR, WriteMode::Normal).unwrap();

        let stats = store.chat_stats(1).unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.deleted_messages, 1);
        assert_eq!(stats.edited_messages, 1);
        assert_eq!(stats.top_sender, Some((7, 2)));

        let recent: Vec<_> = store
            .chat_messages(1, 10, false)
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(recent, vec!["m3", "m1"]);
        assert_eq!(store.chat_messages(1, 10, true).unwrap().len(), 3);

        let totals = store.stats().unwrap();
        assert_eq!(totals.total_messages, 4);
        assert_eq!(totals.active_messages, 3);
        assert_eq!(totals.chats, 2);
        assert_eq!(totals.events, 6);
        assert_eq!(totals.audit_entries, 6);
        assert_eq!(store.export().unwrap().len(), 4);
    }

    #[test]
    fn test_parking_round_trip() {
        let store = create_test_store();
        let id = store.park("stdin", "{\"id\":1}", "database is locked", 5).unwrap();
        let parked = store.parked(10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, id);
        assert_eq!(parked[0].attempts, 5);
        assert_eq!(store.stats().unwrap().parked_events, 1);

        assert!(store.requeue_parked(id, "Conflict: message m1 is deleted", 2).unwrap());
        let parked = store.parked(10).unwrap();
        assert_eq!(parked[0].attempts, 7);
        assert_eq!(parked[0].reason, "Conflict: message m1 is deleted");
        assert_eq!(parked[0].raw, "{\"id\":1}");

        assert!(store.unpark(id).unwrap());
        assert!(!store.unpark(id).unwrap());
        assert!(!store.requeue_parked(id, "gone", 1).unwrap());
        assert!(store.parked(10).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_uses_wal_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("telegram_cache.db");
        let config = StoreConfig {
            pool_size: 3,
            ..StoreConfig::default()
        };
        let store = SqliteStore::open(&path, &config, &Credentials::default()).unwrap();
        assert_eq!(store.pool().size(), 3);

        let conn = store.pool().acquire().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
