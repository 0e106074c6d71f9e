//! Message: the cached, searchable form of a chat message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat identifier as assigned by the platform (Telegram chat ids are signed)
pub type ChatId = i64;

/// Unique identifier for a message
///
/// Serializes as a plain string. Telegram messages use `"{chat_id}:{message_id}"`,
/// generic events use the source event id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a MessageId from a string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the id of a Telegram message scoped to its chat
    pub fn telegram(chat_id: ChatId, message_id: i64) -> Self {
        Self(format!("{}:{}", chat_id, message_id))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Media classification of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Other,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
            Self::Other => "other",
        }
    }

    /// Parse a media type label; unknown labels map to `Other`
    pub fn parse(label: &str) -> Self {
        match label {
            "photo" => Self::Photo,
            "video" => Self::Video,
            "document" => Self::Document,
            "audio" => Self::Audio,
            "voice" => Self::Voice,
            "sticker" => Self::Sticker,
            "animation" => Self::Animation,
            _ => Self::Other,
        }
    }
}

/// A reference to a media file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Platform file reference (not the file contents)
    pub file_id: String,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
        }
    }
}

/// A cached chat message
///
/// `deleted_at` doubles as the tombstone marker: a tombstoned message stays
/// retrievable by id but is left out of default search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: Option<i64>,
    /// Display name of the sender at the time the message was first seen
    pub sender_name: Option<String>,
    pub text: Option<String>,
    pub caption: Option<String>,
    /// Ordered attachment references
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageId>,
    /// Forward origin (user, chat title or hidden sender name)
    pub forwarded_from: Option<String>,
    /// When the platform says the message was sent
    pub timestamp: DateTime<Utc>,
    pub edit_count: u32,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a message with no content
    pub fn new(id: impl Into<MessageId>, chat_id: ChatId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            chat_id,
            sender_id: None,
            sender_name: None,
            text: None,
            caption: None,
            attachments: Vec::new(),
            reply_to: None,
            forwarded_from: None,
            timestamp,
            edit_count: 0,
            edited_at: None,
            deleted_at: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_edited(&self) -> bool {
        self.edit_count > 0
    }

    /// Apply an edit in place, bumping the edit counter
    pub fn apply_edit(&mut self, edit: &MessageEdit) {
        self.text = edit.text.clone();
        self.caption = edit.caption.clone();
        if let Some(attachments) = &edit.attachments {
            self.attachments = attachments.clone();
        }
        self.edit_count += 1;
        self.edited_at = Some(edit.edited_at);
    }

    /// Short preview of the searchable content
    pub fn preview(&self, max_chars: usize) -> String {
        let body = self
            .text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("[media]");
        if body.chars().count() > max_chars {
            let cut: String = body.chars().take(max_chars).collect();
            format!("{}...", cut)
        } else {
            body.to_string()
        }
    }
}

/// New content for an existing message
///
/// Text and caption replace the stored values outright (an edit that drops
/// the caption clears it); attachments are only replaced when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub target: MessageId,
    /// Present when the platform resent the whole message with the edit
    pub chat_id: Option<ChatId>,
    pub sender_id: Option<i64>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    pub edited_at: DateTime<Utc>,
    /// When the message was first sent, if the edit says
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_timestamp: Option<DateTime<Utc>>,
}

impl MessageEdit {
    /// Build a message from an edit whose original was never seen
    ///
    /// The message is dated by `original_timestamp` when the edit carries
    /// it, otherwise by `fallback`. Returns `None` when the edit does not
    /// carry enough to place the message in a chat.
    pub fn to_first_seen(&self, fallback: DateTime<Utc>) -> Option<Message> {
        let chat_id = self.chat_id?;
        let timestamp = self.original_timestamp.unwrap_or(fallback);
        let mut message = Message::new(self.target.clone(), chat_id, timestamp);
        message.sender_id = self.sender_id;
        message.apply_edit(self);
        Some(message)
    }
}
