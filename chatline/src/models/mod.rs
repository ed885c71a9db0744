mod chat;
pub mod input;
mod message;

pub use chat::{participant_key, ChatKind, ChatSummary, ChatUpdate, LastMessage, NewChat};
pub use message::{Attachment, Message, MessagePatch, NewMessage, RawRecord};
