//! MCP server for telecache: ingestion, search and retrieval over the
//! Model Context Protocol.
//!
//! Tools: 3 ingest + 8 query = 11 total.

pub mod params;

use params::*;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::ingest::{IngestPipeline, RetryPolicy};
use crate::query::{QueryService, SearchRequest};
use crate::storage::{MessageStore, WriteMode};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Serialize;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ok_text(text: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn err_text(msg: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg)]))
}

fn ok_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    match serde_json::to_string_pretty(value) {
        Ok(text) => ok_text(text),
        Err(e) => err_text(format!("failed to encode result: {}", e)),
    }
}

fn write_mode(override_tombstone: Option<bool>) -> WriteMode {
    if override_tombstone.unwrap_or(false) {
        WriteMode::Override
    } else {
        WriteMode::Normal
    }
}

// ---------------------------------------------------------------------------
// TelecacheMcpServer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TelecacheMcpServer {
    pipeline: Arc<IngestPipeline>,
    queries: QueryService,
    /// Fires when the server shuts down; in-flight queries stop early
    cancel: CancellationToken,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl TelecacheMcpServer {
    pub fn new(store: Arc<dyn MessageStore>, config: &Config) -> Self {
        let pipeline = IngestPipeline::new(store.clone(), config.ingest_actor())
            .with_retry_policy(RetryPolicy::from_config(&config.ingest))
            .with_event_logging(config.log.debug);

        Self {
            pipeline: Arc::new(pipeline),
            queries: QueryService::new(store, config.query.clone()),
            cancel: CancellationToken::new(),
            tool_router: Self::tool_router(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    // ── Ingest tools ────────────────────────────────────────────────────

    #[tool(description = "Store one inbound chat event (new message, edit, deletion, reaction or system event)")]
    async fn ingest_event(
        &self,
        Parameters(p): Parameters<IngestEventParams>,
    ) -> Result<CallToolResult, McpError> {
        let raw = p.event.to_string();
        match self
            .pipeline
            .ingest_with_mode("mcp", &raw, write_mode(p.override_tombstone))
            .await
        {
            Ok(outcome) => ok_json(&outcome),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "List events parked after repeated storage failures")]
    async fn list_parked(
        &self,
        Parameters(p): Parameters<ListParkedParams>,
    ) -> Result<CallToolResult, McpError> {
        let store = self.pipeline.store().clone();
        let limit = p.limit.unwrap_or(20);
        match tokio::task::spawn_blocking(move || store.parked(limit)).await {
            Ok(Ok(parked)) => ok_json(&parked),
            Ok(Err(e)) => err_text(e.to_string()),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Retry parked events; those that store successfully leave the parking lot")]
    async fn replay_parked(
        &self,
        Parameters(p): Parameters<ReplayParkedParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .pipeline
            .replay_parked(p.limit.unwrap_or(100), write_mode(p.override_tombstone))
            .await
        {
            Ok(report) => ok_json(&report),
            Err(e) => err_text(e.to_string()),
        }
    }

    // ── Query tools ─────────────────────────────────────────────────────

    #[tool(description = "Full-text search over message text and captions, ranked by relevance then recency")]
    async fn search_messages(
        &self,
        Parameters(p): Parameters<SearchMessagesParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = SearchRequest {
            text: p.text,
            chat_id: p.chat_id,
            sender_id: p.sender_id,
            since: p.since,
            until: p.until,
            include_deleted: p.include_deleted.unwrap_or(false),
            limit: p.limit,
            cursor: p.cursor,
        };
        match self.queries.search_messages(request, &self.cancel).await {
            Ok(page) => ok_json(&page),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Get the current state of a message, including deleted ones")]
    async fn get_message(
        &self,
        Parameters(p): Parameters<MessageIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.queries.get_message(p.message_id.as_str()).await {
            Ok(Some(message)) => ok_json(&message),
            Ok(None) => err_text(format!("message not found: {}", p.message_id)),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Get a message together with every event that touched it")]
    async fn message_history(
        &self,
        Parameters(p): Parameters<MessageIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.queries.message_history(p.message_id.as_str()).await {
            Ok(Some(history)) => ok_json(&history),
            Ok(None) => err_text(format!("message not found: {}", p.message_id)),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Newest messages in a chat")]
    async fn recent_messages(
        &self,
        Parameters(p): Parameters<RecentMessagesParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .queries
            .recent_messages(p.chat_id, p.limit, p.include_deleted.unwrap_or(false))
            .await
        {
            Ok(messages) => ok_json(&messages),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Most recently deleted messages, optionally within one chat")]
    async fn deleted_messages(
        &self,
        Parameters(p): Parameters<DeletedMessagesParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.queries.deleted_messages(p.chat_id, p.limit).await {
            Ok(messages) => ok_json(&messages),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Message counts and most active sender for a chat")]
    async fn chat_stats(
        &self,
        Parameters(p): Parameters<ChatIdParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.queries.chat_stats(p.chat_id).await {
            Ok(stats) => ok_json(&stats),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Totals for the whole cache")]
    async fn store_stats(&self) -> Result<CallToolResult, McpError> {
        match self.queries.stats().await {
            Ok(stats) => ok_json(&stats),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Audit log entries for a message or event, oldest first")]
    async fn audit_trail(
        &self,
        Parameters(p): Parameters<AuditTrailParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.queries.audit_trail(p.target_id).await {
            Ok(entries) => ok_json(&entries),
            Err(e) => err_text(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for TelecacheMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "telecache MCP server: cache chat events and search message history".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve MCP on stdio until stdin closes or Ctrl-C, returning the exit code
pub fn run_mcp_server(config: &Config) -> i32 {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create tokio runtime");
            return 1;
        }
    };

    rt.block_on(async {
        let path = config.store.resolved_path();
        let store: Arc<dyn MessageStore> = match crate::open_store(config) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open database");
                return 1;
            }
        };

        let server = TelecacheMcpServer::new(store, config);
        let cancel = server.cancellation().clone();

        tracing::info!(path = %path.display(), "telecache mcp server starting on stdio");

        let service = match server.serve(rmcp::transport::stdio()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to start MCP server");
                return 1;
            }
        };

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "MCP server error");
                    return 1;
                }
                tracing::info!("stdin closed; shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; shutting down");
            }
        }
        cancel.cancel();
        0
    })
}
