//! MCP tool parameter structs with schemars-derived JSON schemas.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

// ── Ingest params ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct IngestEventParams {
    #[schemars(description = "Raw inbound event: a Telegram Update object or a generic event with id, type, chat_id, timestamp")]
    pub event: serde_json::Value,
    #[schemars(description = "Apply edits to deleted messages, lifting the tombstone (default false)")]
    pub override_tombstone: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListParkedParams {
    #[schemars(description = "Maximum number of parked events to return (default 20)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReplayParkedParams {
    #[schemars(description = "Maximum number of parked events to replay (default 100)")]
    pub limit: Option<usize>,
    #[schemars(description = "Apply edits to deleted messages, lifting the tombstone (default false)")]
    pub override_tombstone: Option<bool>,
}

// ── Query params ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchMessagesParams {
    #[schemars(description = "Words to search for in message text and captions")]
    pub text: String,
    #[schemars(description = "Restrict to one chat")]
    pub chat_id: Option<i64>,
    #[schemars(description = "Restrict to one sender")]
    pub sender_id: Option<i64>,
    #[schemars(description = "Only messages sent at or after this time (RFC 3339)")]
    pub since: Option<DateTime<Utc>>,
    #[schemars(description = "Only messages sent before this time (RFC 3339)")]
    pub until: Option<DateTime<Utc>>,
    #[schemars(description = "Include deleted messages (default false)")]
    pub include_deleted: Option<bool>,
    #[schemars(description = "Page size")]
    pub limit: Option<usize>,
    #[schemars(description = "next_cursor from a previous page")]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MessageIdParams {
    #[schemars(description = "Message ID (chat_id:message_id for Telegram messages)")]
    pub message_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecentMessagesParams {
    pub chat_id: i64,
    pub limit: Option<usize>,
    #[schemars(description = "Include deleted messages (default false)")]
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeletedMessagesParams {
    #[schemars(description = "Restrict to one chat")]
    pub chat_id: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChatIdParams {
    pub chat_id: i64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AuditTrailParams {
    #[schemars(description = "Message ID or event ID")]
    pub target_id: String,
}
