//! Core record types: messages, events and audit log entries

mod audit;
mod event;
mod message;

pub use audit::{AuditLogEntry, AuditOperation, Collection};
pub use event::{Event, EventId, EventKind};
pub use message::{Attachment, AttachmentKind, ChatId, Message, MessageEdit, MessageId};
