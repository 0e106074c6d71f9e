//! Event: one inbound notification, stored once and never mutated

use super::message::{ChatId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source event identifier, the key the idempotency gate works on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Event id for a Telegram `Update`
    pub fn telegram(update_id: i64) -> Self {
        Self(format!("tg:{}", update_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What an event reports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventKind {
    Created,
    Edited,
    Deleted,
    Reacted,
    MemberLeft,
    MemberJoined,
    /// Any other platform notification, kept as a self-contained event
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
            Self::Deleted => "deleted",
            Self::Reacted => "reacted",
            Self::MemberLeft => "member_left",
            Self::MemberJoined => "member_joined",
            Self::Other(name) => name,
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "created" => Self::Created,
            "edited" => Self::Edited,
            "deleted" => Self::Deleted,
            "reacted" => Self::Reacted,
            "member_left" => Self::MemberLeft,
            "member_joined" => Self::MemberJoined,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::parse(&s)
    }
}

/// A stored inbound event
///
/// `message_id` is a weak reference: system events (members joining or
/// leaving) carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub message_id: Option<MessageId>,
    pub chat_id: Option<ChatId>,
    /// Opaque platform payload, kept verbatim
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(id: impl Into<EventId>, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            message_id: None,
            chat_id: None,
            payload: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn for_message(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn in_chat(mut self, chat_id: ChatId) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
