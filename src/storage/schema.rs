//! Schema migrations
//!
//! Versioned through `PRAGMA user_version`. Each entry in [`MIGRATIONS`]
//! runs once, in its own transaction, in order. Indexes needed by query
//! paths are declared here; nothing outside this list may be assumed to
//! exist.

use super::traits::StorageResult;
use rusqlite::Connection;

const MIGRATIONS: &[&str] = &[
    // 1: collections and the text index
    r#"
    -- seq is the rowid the text index is keyed on; it must survive VACUUM
    CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        chat_id INTEGER NOT NULL,
        sender_id INTEGER,
        sender_name TEXT,
        text TEXT,
        caption TEXT,
        attachments_json TEXT NOT NULL DEFAULT '[]',
        reply_to TEXT,
        forwarded_from TEXT,
        timestamp TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        edit_count INTEGER NOT NULL DEFAULT 0,
        edited_at TEXT,
        deleted_at TEXT,
        deleted_at_ms INTEGER
    );

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        message_id TEXT,
        chat_id INTEGER,
        payload_json TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        operation TEXT NOT NULL,
        actor TEXT NOT NULL,
        target_collection TEXT NOT NULL,
        target_id TEXT NOT NULL,
        before_json TEXT,
        after_json TEXT,
        timestamp TEXT NOT NULL
    );

    -- Combined text index over text and caption, keyed by messages.rowid
    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
        text,
        caption,
        tokenize = 'unicode61 remove_diacritics 2'
    );

    -- audit_log is append-only
    CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit_log is append-only');
    END;

    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit_log is append-only');
    END;
    "#,
    // 2: indexes for history, listing and audit lookups
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages(chat_id, timestamp_ms DESC);
    CREATE INDEX IF NOT EXISTS idx_messages_deleted
        ON messages(deleted_at_ms) WHERE deleted_at_ms IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_messages_sender
        ON messages(chat_id, sender_id);
    CREATE INDEX IF NOT EXISTS idx_events_message
        ON events(message_id, timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_audit_target
        ON audit_log(target_id);
    "#,
    // 3: parking lot for events that exhausted their retries
    r#"
    CREATE TABLE IF NOT EXISTS parked_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        raw TEXT NOT NULL,
        reason TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        parked_at TEXT NOT NULL
    );
    "#,
    // 4: substring search; rebuild the text index over trigrams
    r#"
    DROP TABLE IF EXISTS messages_fts;
    CREATE VIRTUAL TABLE messages_fts USING fts5(
        text,
        caption,
        tokenize = 'trigram'
    );
    INSERT INTO messages_fts (rowid, text, caption)
        SELECT seq, text, caption FROM messages;
    "#,
];

/// Latest schema version
pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub fn current_version(conn: &Connection) -> StorageResult<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply pending migrations, returning how many ran
pub fn migrate(conn: &mut Connection) -> StorageResult<usize> {
    let current = current_version(conn)? as usize;
    let mut applied = 0;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        // PRAGMA does not take bound parameters
        tx.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_fresh_database_to_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        let applied = migrate(&mut conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), 0);
    }

    #[test]
    fn resumes_from_partial_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.execute_batch("PRAGMA user_version = 1").unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), MIGRATIONS.len() - 1);

        let has_index: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = 'idx_audit_target'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(has_index);
    }

    #[test]
    fn trigram_rebuild_keeps_indexed_messages() {
        let mut conn = Connection::open_in_memory().unwrap();
        for sql in &MIGRATIONS[..3] {
            conn.execute_batch(sql).unwrap();
        }
        conn.execute_batch("PRAGMA user_version = 3").unwrap();
        conn.execute(
            "INSERT INTO messages (id, chat_id, text, caption, timestamp, timestamp_ms)
             VALUES ('m1', 1, 'helloworld', NULL, '2024-01-01T00:00:00Z', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages_fts (rowid, text, caption) SELECT seq, text, caption FROM messages",
            [],
        )
        .unwrap();

        assert_eq!(migrate(&mut conn).unwrap(), 1);
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH '\"lowor\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn audit_log_rejects_updates_and_deletes() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO audit_log (id, operation, actor, target_collection, target_id, timestamp)
             VALUES ('a1', 'message_created', 'test', 'messages', 'm1', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE audit_log SET actor = 'mallory' WHERE id = 'a1'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM audit_log WHERE id = 'a1'", []).is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
