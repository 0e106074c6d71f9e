//! Generic event dialect
//!
//! ```json
//! {"id": "e1", "type": "message", "chat_id": 42, "sender_id": 7,
//!  "text": "hello world", "timestamp": "2024-01-01T00:00:00Z"}
//! ```
//!
//! `type` defaults to `message`. Edits, deletions and reactions name their
//! target in `message_id`; a `message` event uses its own `id` as the
//! message id unless `message_id` overrides it.

use super::{
    id_field, int_field, str_field, timestamp_field, Change, MalformedEventError, NormalizedEvent,
};
use crate::model::{Attachment, AttachmentKind, Event, EventKind, Message, MessageEdit, MessageId};
use serde_json::{Map, Value};

pub(super) fn normalize_event(
    object: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let id = id_field(object, "id")?.ok_or(MalformedEventError::MissingField("id"))?;
    let timestamp =
        timestamp_field(object, "timestamp")?.ok_or(MalformedEventError::MissingField("timestamp"))?;
    let kind = str_field(object, "type")?.unwrap_or_else(|| "message".to_string());
    let chat_id = int_field(object, "chat_id")?;
    let target = id_field(object, "message_id")?.map(MessageId::from);
    let payload = Value::Object(object.clone());

    let (kind, change) = match kind.as_str() {
        "message" | "created" => {
            let chat_id = chat_id.ok_or(MalformedEventError::MissingField("chat_id"))?;
            let message_id = target.unwrap_or_else(|| MessageId::from(id.as_str()));
            let mut message = Message::new(message_id, chat_id, timestamp);
            message.sender_id = int_field(object, "sender_id")?;
            message.sender_name = str_field(object, "sender_name")?;
            message.text = str_field(object, "text")?;
            message.caption = str_field(object, "caption")?;
            message.attachments = attachments(object)?.unwrap_or_default();
            message.reply_to = id_field(object, "reply_to")?.map(MessageId::from);
            message.forwarded_from = str_field(object, "forwarded_from")?;
            (EventKind::Created, Change::Create(message))
        }
        "edited" | "edit" => {
            let target = target.ok_or(MalformedEventError::MissingField("message_id"))?;
            let edit = MessageEdit {
                target,
                chat_id,
                sender_id: int_field(object, "sender_id")?,
                text: str_field(object, "text")?,
                caption: str_field(object, "caption")?,
                attachments: attachments(object)?,
                edited_at: timestamp,
                original_timestamp: None,
            };
            (EventKind::Edited, Change::Edit(edit))
        }
        "deleted" | "delete" => {
            let target = target.ok_or(MalformedEventError::MissingField("message_id"))?;
            (EventKind::Deleted, Change::Tombstone(target))
        }
        "reaction" | "reacted" => {
            if target.is_none() {
                return Err(MalformedEventError::MissingField("message_id"));
            }
            (EventKind::Reacted, Change::Record)
        }
        "member_left" => (EventKind::MemberLeft, Change::Record),
        "member_joined" => (EventKind::MemberJoined, Change::Record),
        other => (EventKind::Other(other.to_string()), Change::Record),
    };

    let mut event = Event::new(id, kind, timestamp).with_payload(payload);
    event.chat_id = chat_id;
    event.message_id = match &change {
        Change::Create(message) => Some(message.id.clone()),
        Change::Edit(edit) => Some(edit.target.clone()),
        Change::Tombstone(target) => Some(target.clone()),
        Change::Record => id_field(object, "message_id")?.map(MessageId::from),
    };

    Ok(NormalizedEvent { event, change })
}

fn attachments(object: &Map<String, Value>) -> Result<Option<Vec<Attachment>>, MalformedEventError> {
    let Some(value) = object.get("attachments") else {
        return Ok(None);
    };
    let items = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => items,
        _ => {
            return Err(MalformedEventError::InvalidField {
                field: "attachments",
                reason: "expected an array".into(),
            })
        }
    };

    items
        .iter()
        .map(|item| match item {
            // Bare strings are file references of unknown kind
            Value::String(file_id) => Ok(Attachment::new(AttachmentKind::Other, file_id.clone())),
            Value::Object(obj) => {
                let file_id = str_field(obj, "file_id")?
                    .ok_or(MalformedEventError::MissingField("attachments[].file_id"))?;
                let kind = str_field(obj, "kind")?
                    .map(|k| AttachmentKind::parse(&k))
                    .unwrap_or(AttachmentKind::Other);
                Ok(Attachment::new(kind, file_id))
            }
            _ => Err(MalformedEventError::InvalidField {
                field: "attachments",
                reason: "entries must be strings or objects".into(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
