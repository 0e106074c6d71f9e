//! Telegram Bot API dialect
//!
//! Handles `message`, `channel_post`, `edited_message`,
//! `edited_channel_post` and `message_reaction` updates. Service messages
//! announcing members leaving or joining become self-contained events.
//! Other update types are recorded as-is when they carry a chat and a date.

use super::{
    id_field, int_field, str_field, timestamp_field, Change, MalformedEventError, NormalizedEvent,
};
use crate::model::{
    Attachment, AttachmentKind, ChatId, Event, EventId, EventKind, Message, MessageEdit, MessageId,
};
use serde_json::{Map, Value};

/// Single-object media fields, checked in this order after `photo`
const MEDIA_FIELDS: [(&str, AttachmentKind); 6] = [
    ("video", AttachmentKind::Video),
    ("document", AttachmentKind::Document),
    ("audio", AttachmentKind::Audio),
    ("voice", AttachmentKind::Voice),
    ("sticker", AttachmentKind::Sticker),
    ("animation", AttachmentKind::Animation),
];

pub(super) fn normalize_update(
    update: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let update_id = int_field(update, "update_id")?.ok_or(MalformedEventError::MissingField("update_id"))?;
    let event_id = EventId::telegram(update_id);

    for field in ["message", "channel_post"] {
        if let Some(message) = update.get(field) {
            return new_message(event_id, object(message, "message")?);
        }
    }
    for field in ["edited_message", "edited_channel_post"] {
        if let Some(message) = update.get(field) {
            return edited_message(event_id, object(message, "edited_message")?);
        }
    }
    if let Some(reaction) = update.get("message_reaction") {
        return reaction_update(event_id, object(reaction, "message_reaction")?);
    }

    other_update(event_id, update)
}

fn object<'a>(
    value: &'a Value,
    field: &'static str,
) -> Result<&'a Map<String, Value>, MalformedEventError> {
    value.as_object().ok_or_else(|| MalformedEventError::InvalidField {
        field,
        reason: "expected an object".into(),
    })
}

fn chat_id(message: &Map<String, Value>) -> Result<ChatId, MalformedEventError> {
    let chat = message
        .get("chat")
        .ok_or(MalformedEventError::MissingField("chat"))?;
    int_field(object(chat, "chat")?, "id")?.ok_or(MalformedEventError::MissingField("chat.id"))
}

fn message_id(message: &Map<String, Value>, chat_id: ChatId) -> Result<MessageId, MalformedEventError> {
    let id = int_field(message, "message_id")?.ok_or(MalformedEventError::MissingField("message_id"))?;
    Ok(MessageId::telegram(chat_id, id))
}

fn new_message(
    event_id: EventId,
    message: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let chat_id = chat_id(message)?;
    let timestamp = timestamp_field(message, "date")?.ok_or(MalformedEventError::MissingField("date"))?;
    let payload = Value::Object(message.clone());

    // Membership service messages describe the chat, not a message
    if let Some(left) = message.get("left_chat_member") {
        let event = Event::new(event_id, EventKind::MemberLeft, timestamp)
            .in_chat(chat_id)
            .with_payload(member_payload(left));
        return Ok(NormalizedEvent {
            event,
            change: Change::Record,
        });
    }
    if let Some(joined) = message.get("new_chat_members") {
        let members = joined
            .as_array()
            .map(|m| m.iter().map(member_payload).collect::<Vec<_>>())
            .unwrap_or_default();
        let event = Event::new(event_id, EventKind::MemberJoined, timestamp)
            .in_chat(chat_id)
            .with_payload(Value::Array(members));
        return Ok(NormalizedEvent {
            event,
            change: Change::Record,
        });
    }

    let id = message_id(message, chat_id)?;
    let mut msg = Message::new(id.clone(), chat_id, timestamp);
    if let Some(from) = message.get("from").and_then(Value::as_object) {
        msg.sender_id = int_field(from, "id")?;
        msg.sender_name = display_name(from)?;
    }
    msg.text = str_field(message, "text")?;
    msg.caption = str_field(message, "caption")?;
    msg.attachments = attachments(message)?;
    msg.forwarded_from = forward_origin(message)?;
    if let Some(reply) = message.get("reply_to_message").and_then(Value::as_object) {
        if let Some(reply_id) = int_field(reply, "message_id")? {
            msg.reply_to = Some(MessageId::telegram(chat_id, reply_id));
        }
    }

    let event = Event::new(event_id, EventKind::Created, timestamp)
        .for_message(id)
        .in_chat(chat_id)
        .with_payload(payload);
    Ok(NormalizedEvent {
        event,
        change: Change::Create(msg),
    })
}

fn edited_message(
    event_id: EventId,
    message: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let chat_id = chat_id(message)?;
    let id = message_id(message, chat_id)?;
    // Edits carry the original `date`; the edit time is `edit_date`
    let sent_at = timestamp_field(message, "date")?;
    let edited_at = match timestamp_field(message, "edit_date")? {
        Some(ts) => ts,
        None => sent_at.ok_or(MalformedEventError::MissingField("edit_date"))?,
    };

    let sender_id = match message.get("from").and_then(Value::as_object) {
        Some(from) => int_field(from, "id")?,
        None => None,
    };
    let attachments = attachments(message)?;
    let edit = MessageEdit {
        target: id.clone(),
        chat_id: Some(chat_id),
        sender_id,
        text: str_field(message, "text")?,
        caption: str_field(message, "caption")?,
        attachments: if attachments.is_empty() { None } else { Some(attachments) },
        edited_at,
        original_timestamp: sent_at,
    };

    let event = Event::new(event_id, EventKind::Edited, edited_at)
        .for_message(id)
        .in_chat(chat_id)
        .with_payload(Value::Object(message.clone()));
    Ok(NormalizedEvent {
        event,
        change: Change::Edit(edit),
    })
}

fn reaction_update(
    event_id: EventId,
    reaction: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let chat_id = chat_id(reaction)?;
    let id = message_id(reaction, chat_id)?;
    let timestamp = timestamp_field(reaction, "date")?.ok_or(MalformedEventError::MissingField("date"))?;
    let event = Event::new(event_id, EventKind::Reacted, timestamp)
        .for_message(id)
        .in_chat(chat_id)
        .with_payload(Value::Object(reaction.clone()));
    Ok(NormalizedEvent {
        event,
        change: Change::Record,
    })
}

fn other_update(
    event_id: EventId,
    update: &Map<String, Value>,
) -> Result<NormalizedEvent, MalformedEventError> {
    let (kind, body) = update
        .iter()
        .find(|(key, value)| key.as_str() != "update_id" && value.is_object())
        .ok_or(MalformedEventError::MissingField("update body"))?;
    let body = object(body, "update body")?;
    let timestamp = timestamp_field(body, "date")?.ok_or(MalformedEventError::MissingField("date"))?;

    let mut event = Event::new(event_id, EventKind::Other(kind.clone()), timestamp)
        .with_payload(Value::Object(body.clone()));
    if body.contains_key("chat") {
        event.chat_id = Some(chat_id(body)?);
    }
    Ok(NormalizedEvent {
        event,
        change: Change::Record,
    })
}

/// `@username`, else first and last name joined
fn display_name(user: &Map<String, Value>) -> Result<Option<String>, MalformedEventError> {
    if let Some(username) = str_field(user, "username")? {
        return Ok(Some(format!("@{}", username)));
    }
    let first = str_field(user, "first_name")?;
    let last = str_field(user, "last_name")?;
    Ok(match (first, last) {
        (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
        (Some(f), None) => Some(f),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    })
}

fn member_payload(user: &Value) -> Value {
    let mut out = Map::new();
    if let Some(user) = user.as_object() {
        for key in ["id", "username", "first_name", "last_name", "is_bot"] {
            if let Some(v) = user.get(key) {
                out.insert(key.to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn attachments(message: &Map<String, Value>) -> Result<Vec<Attachment>, MalformedEventError> {
    // Photos arrive as a list of sizes, largest last
    if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
        if let Some(largest) = sizes.last().and_then(Value::as_object) {
            if let Some(file_id) = id_field(largest, "file_id")? {
                return Ok(vec![Attachment::new(AttachmentKind::Photo, file_id)]);
            }
        }
    }
    for (field, kind) in MEDIA_FIELDS {
        if let Some(media) = message.get(field).and_then(Value::as_object) {
            if let Some(file_id) = id_field(media, "file_id")? {
                return Ok(vec![Attachment::new(kind, file_id)]);
            }
        }
    }
    Ok(Vec::new())
}

fn forward_origin(message: &Map<String, Value>) -> Result<Option<String>, MalformedEventError> {
    if let Some(user) = message.get("forward_from").and_then(Value::as_object) {
        return display_name(user);
    }
    if let Some(chat) = message.get("forward_from_chat").and_then(Value::as_object) {
        return match str_field(chat, "title")? {
            Some(title) => Ok(Some(title)),
            None => Ok(id_field(chat, "id")?.map(|id| format!("chat {}", id))),
        };
    }
    str_field(message, "forward_sender_name")
}
