use crate::cancel::CancellationToken;
use crate::config::QueryConfig;
use crate::model::{AuditLogEntry, ChatId, Message, MessageId};
use crate::storage::{
    ChatStats, MessageHistory, MessageStore, SearchCursor, SearchFilter, SearchHit, SearchPage,
    SearchQuery, SearchResults, StorageError, StorageResult, StoreStats,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Bad search text or cursor
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(StorageError),

    #[error("query cancelled")]
    Cancelled,

    #[error("query task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidQuery(msg) | StorageError::InvalidCursor(msg) => Self::InvalidRequest(msg),
            other => Self::Storage(other),
        }
    }
}

/// A text search with optional restrictions and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub text: String,
    pub chat_id: Option<ChatId>,
    pub sender_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    /// Page size; the configured default when absent
    pub limit: Option<usize>,
    /// `next_cursor` from a previous page
    pub cursor: Option<String>,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn filter(&self) -> SearchFilter {
        let mut filter = SearchFilter::new().between(self.since, self.until);
        filter.chat_id = self.chat_id;
        filter.sender_id = self.sender_id;
        filter.include_deleted = self.include_deleted;
        filter
    }
}

/// Read-side entry point over a shared store
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn MessageStore>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(store: Arc<dyn MessageStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Effective page size for a requested limit
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.config.default_limit,
            Some(n) => n.min(self.config.max_limit),
        }
    }

    /// One page of ranked results plus the cursor for the next
    pub async fn search_messages(
        &self,
        request: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchPage, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let cursor = request
            .cursor
            .as_deref()
            .map(SearchCursor::decode)
            .transpose()?;
        let query = SearchQuery::new(request.text.clone(), self.clamp_limit(request.limit))
            .with_filter(request.filter())
            .after(cursor);

        let page = self.blocking(move |store| store.search(&query)).await?;
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        Ok(page)
    }

    /// Walk result pages until `max_hits` hits are collected or results run out
    ///
    /// The token is checked before each page is fetched; cancelling returns
    /// `Cancelled` and discards the partial result.
    pub async fn collect_search(
        &self,
        request: SearchRequest,
        max_hits: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, QueryError> {
        let cursor = request
            .cursor
            .as_deref()
            .map(SearchCursor::decode)
            .transpose()?;
        let page_size = self.clamp_limit(request.limit);
        let query = SearchQuery::new(request.text.clone(), page_size)
            .with_filter(request.filter())
            .after(cursor);
        let cancel = cancel.clone();

        let store = self.store.clone();
        let hits = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for (n, hit) in SearchResults::new(store.as_ref(), query).take(max_hits).enumerate() {
                // A new page starts every `page_size` hits
                if n % page_size == 0 && cancel.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                hits.push(hit?);
            }
            Ok(hits)
        })
        .await??;
        Ok(hits)
    }

    /// Current state of a message, tombstoned or not
    pub async fn get_message(&self, id: impl Into<MessageId>) -> Result<Option<Message>, QueryError> {
        let id = id.into();
        self.blocking(move |store| store.get(&id)).await
    }

    /// A message and its events, read together
    pub async fn message_history(&self, id: impl Into<MessageId>) -> Result<Option<MessageHistory>, QueryError> {
        let id = id.into();
        self.blocking(move |store| store.history(&id)).await
    }

    /// Newest messages in a chat
    pub async fn recent_messages(
        &self,
        chat_id: ChatId,
        limit: Option<usize>,
        include_deleted: bool,
    ) -> Result<Vec<Message>, QueryError> {
        let limit = self.clamp_limit(limit);
        self.blocking(move |store| store.chat_messages(chat_id, limit, include_deleted))
            .await
    }

    /// Most recently deleted messages, optionally within one chat
    pub async fn deleted_messages(&self, chat_id: Option<ChatId>, limit: Option<usize>) -> Result<Vec<Message>, QueryError> {
        let limit = self.clamp_limit(limit);
        self.blocking(move |store| store.deleted_messages(chat_id, limit)).await
    }

    pub async fn chat_stats(&self, chat_id: ChatId) -> Result<ChatStats, QueryError> {
        self.blocking(move |store| store.chat_stats(chat_id)).await
    }

    pub async fn stats(&self) -> Result<StoreStats, QueryError> {
        self.blocking(|store| store.stats()).await
    }

    /// Audit entries for a message or event id, oldest first
    pub async fn audit_trail(&self, target_id: impl Into<String>) -> Result<Vec<AuditLogEntry>, QueryError> {
        let target_id = target_id.into();
        self.blocking(move |store| store.audit_for(&target_id)).await
    }

    /// Every message, for backups
    pub async fn export(&self) -> Result<Vec<Message>, QueryError> {
        self.blocking(|store| store.export()).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MessageStore) -> StorageResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || f(store.as_ref())).await?;
        Ok(result?)
    }
}
