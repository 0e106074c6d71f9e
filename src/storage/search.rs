//! Full-text search: query building, cursors and text index maintenance
//!
//! The index is the `messages_fts` FTS5 table over trigrams, keyed by
//! `messages.rowid`. A query matches any message whose text or caption
//! contains it as a substring, ignoring case. Results rank by `bm25()`
//! (lower is better), ties broken by newer timestamp first, then by id.
//! Cursors are keyset positions in that order.

use super::traits::{MessageStore, SearchHit, StorageError, StorageResult};
use crate::model::{ChatId, Message};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;

/// Optional restrictions on a search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub chat_id: Option<ChatId>,
    pub sender_id: Option<i64>,
    /// Inclusive lower bound on the message timestamp
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the message timestamp
    pub until: Option<DateTime<Utc>>,
    /// Tombstoned messages are skipped unless set
    pub include_deleted: bool,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_chat(mut self, chat_id: ChatId) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn from_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Keyset position after the last returned hit
///
/// The position includes the hit's bm25 score, which depends on the whole
/// index. Pages resumed from a cursor line up exactly only while no message
/// is written in between; after writes, a resumed walk may skip or repeat
/// hits near the page boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCursor {
    pub score: f64,
    pub timestamp_ms: i64,
    pub id: String,
}

impl SearchCursor {
    fn after(hit: &SearchHit) -> Self {
        Self {
            score: hit.score,
            timestamp_ms: hit.message.timestamp.timestamp_millis(),
            id: hit.message.id.as_str().to_string(),
        }
    }

    /// Opaque text form: `<score bits hex>.<timestamp ms>.<id>`
    pub fn encode(&self) -> String {
        format!("{:016x}.{}.{}", self.score.to_bits(), self.timestamp_ms, self.id)
    }

    pub fn decode(text: &str) -> StorageResult<Self> {
        let mut parts = text.splitn(3, '.');
        let (Some(bits), Some(ts), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(StorageError::InvalidCursor(text.to_string()));
        };
        let bits = u64::from_str_radix(bits, 16)
            .map_err(|_| StorageError::InvalidCursor(text.to_string()))?;
        let timestamp_ms = ts
            .parse::<i64>()
            .map_err(|_| StorageError::InvalidCursor(text.to_string()))?;
        Ok(Self {
            score: f64::from_bits(bits),
            timestamp_ms,
            id: id.to_string(),
        })
    }
}

impl std::fmt::Display for SearchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for SearchCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for SearchCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::decode(&text).map_err(serde::de::Error::custom)
    }
}

/// One page request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub filter: SearchFilter,
    pub limit: usize,
    pub cursor: Option<SearchCursor>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            filter: SearchFilter::default(),
            limit,
            cursor: None,
        }
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn after(mut self, cursor: Option<SearchCursor>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// Shortest query the trigram index can answer
const TRIGRAM_CHARS: usize = 3;

/// How a query is matched against stored text
#[derive(Debug, Clone, PartialEq)]
pub enum TextMatch {
    /// FTS5 phrase over the trigram index, ranked by bm25
    Phrase(String),
    /// Too short for trigrams: a scan where every hit ranks equal
    Scan(String),
}

/// Classify free text as a substring query
///
/// Surrounding whitespace is dropped; inner whitespace is part of the
/// substring. Quoting keeps FTS5 operators in user input inert. Returns
/// `None` when nothing is left to search for.
pub fn text_match(text: &str) -> Option<TextMatch> {
    let needle = text.trim();
    if needle.is_empty() {
        return None;
    }
    if needle.chars().count() < TRIGRAM_CHARS {
        Some(TextMatch::Scan(needle.to_string()))
    } else {
        Some(TextMatch::Phrase(format!("\"{}\"", needle.replace('"', "\"\""))))
    }
}

/// Run one page of a search on a connection
pub(super) fn search_page(conn: &Connection, query: &SearchQuery) -> StorageResult<(Vec<SearchHit>, bool)> {
    use super::rows::{MessageRow, MESSAGE_COLUMNS};

    let text_match = text_match(&query.text)
        .ok_or_else(|| StorageError::InvalidQuery("nothing to search for".into()))?;
    if query.limit == 0 {
        return Ok((Vec::new(), false));
    }

    let columns = prefixed_columns("m", MESSAGE_COLUMNS);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    let mut inner = match text_match {
        TextMatch::Phrase(expression) => format!(
            "SELECT {}, m.timestamp_ms AS ts_ms, bm25(messages_fts) AS score \
             FROM messages_fts JOIN messages m ON m.rowid = messages_fts.rowid \
             WHERE messages_fts MATCH {}",
            columns,
            bind(&mut params_vec, expression)
        ),
        TextMatch::Scan(needle) => {
            // lower() folds ASCII only; longer queries get the index's Unicode folding
            let n = bind(&mut params_vec, needle);
            format!(
                "SELECT {columns}, m.timestamp_ms AS ts_ms, 0.0 AS score \
                 FROM messages m \
                 WHERE (instr(lower(coalesce(m.text, '')), lower({n})) > 0 \
                     OR instr(lower(coalesce(m.caption, '')), lower({n})) > 0)"
            )
        }
    };
    if let Some(chat_id) = query.filter.chat_id {
        inner.push_str(&format!(" AND m.chat_id = {}", bind(&mut params_vec, chat_id)));
    }
    if let Some(sender_id) = query.filter.sender_id {
        inner.push_str(&format!(" AND m.sender_id = {}", bind(&mut params_vec, sender_id)));
    }
    if let Some(since) = query.filter.since {
        inner.push_str(&format!(" AND m.timestamp_ms >= {}", bind(&mut params_vec, since.timestamp_millis())));
    }
    if let Some(until) = query.filter.until {
        inner.push_str(&format!(" AND m.timestamp_ms < {}", bind(&mut params_vec, until.timestamp_millis())));
    }
    if !query.filter.include_deleted {
        inner.push_str(" AND m.deleted_at IS NULL");
    }

    let mut sql = format!("SELECT * FROM ({}) AS ranked", inner);
    if let Some(cursor) = &query.cursor {
        let s = bind(&mut params_vec, cursor.score);
        let t = bind(&mut params_vec, cursor.timestamp_ms);
        let i = bind(&mut params_vec, cursor.id.clone());
        sql.push_str(&format!(
            " WHERE score > {s} OR (score = {s} AND ts_ms < {t}) OR (score = {s} AND ts_ms = {t} AND id > {i})"
        ));
    }
    // One extra row tells whether another page exists
    let limit = bind(&mut params_vec, (query.limit + 1) as i64);
    sql.push_str(&format!(" ORDER BY score ASC, ts_ms DESC, id ASC LIMIT {}", limit));

    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        Ok((MessageRow::read(row, 0)?, row.get::<_, f64>(14)?))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (message_row, score) = row?;
        hits.push(SearchHit {
            message: message_row.into_message()?,
            score,
        });
    }
    let has_more = hits.len() > query.limit;
    hits.truncate(query.limit);
    Ok((hits, has_more))
}

/// Cursor for the page following `hits`
pub(super) fn next_cursor(hits: &[SearchHit], has_more: bool) -> Option<SearchCursor> {
    if has_more {
        hits.last().map(SearchCursor::after)
    } else {
        None
    }
}

/// Add a bound value, returning its numbered placeholder
fn bind(params: &mut Vec<Box<dyn rusqlite::ToSql>>, value: impl rusqlite::ToSql + 'static) -> String {
    params.push(Box::new(value));
    format!("?{}", params.len())
}

fn prefixed_columns(alias: &str, columns: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Index maintenance
// ---------------------------------------------------------------------------

/// Add a message to the text index; failures surface as `IndexUpdate`
pub(super) fn index_insert(conn: &Connection, rowid: i64, message: &Message) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO messages_fts (rowid, text, caption) VALUES (?1, ?2, ?3)",
        params![rowid, message.text, message.caption],
    )
    .map_err(StorageError::IndexUpdate)?;
    Ok(())
}

/// Replace a message's indexed text
pub(super) fn index_update(conn: &Connection, rowid: i64, message: &Message) -> StorageResult<()> {
    let updated = conn
        .execute(
            "UPDATE messages_fts SET text = ?2, caption = ?3 WHERE rowid = ?1",
            params![rowid, message.text, message.caption],
        )
        .map_err(StorageError::IndexUpdate)?;
    if updated == 0 {
        // Row missing from the index: restore it rather than leave it unsearchable
        index_insert(conn, rowid, message)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lazy iteration
// ---------------------------------------------------------------------------

/// Lazy sequence of search hits across pages
///
/// Pages are fetched on demand. [`SearchResults::cursor`] gives the position
/// to restart from after the hits consumed so far.
pub struct SearchResults<'a, S: MessageStore + ?Sized> {
    store: &'a S,
    query: SearchQuery,
    buffer: VecDeque<SearchHit>,
    exhausted: bool,
    failed: bool,
}

impl<'a, S: MessageStore + ?Sized> SearchResults<'a, S> {
    pub fn new(store: &'a S, query: SearchQuery) -> Self {
        Self {
            store,
            query,
            buffer: VecDeque::new(),
            exhausted: false,
            failed: false,
        }
    }

    /// Restart position after the last hit yielded
    pub fn cursor(&self) -> Option<&SearchCursor> {
        self.query.cursor.as_ref()
    }

    fn fill(&mut self) -> StorageResult<()> {
        let page = self.store.search(&self.query)?;
        self.exhausted = page.next_cursor.is_none();
        self.buffer.extend(page.hits);
        Ok(())
    }
}

impl<S: MessageStore + ?Sized> Iterator for SearchResults<'_, S> {
    type Item = StorageResult<SearchHit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let hit = self.buffer.pop_front()?;
        self.query.cursor = Some(SearchCursor::after(&hit));
        Some(Ok(hit))
    }
}
