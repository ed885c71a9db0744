//! Actions performed by the signed-in participant: opening direct chats and
//! sending, forwarding, editing, deleting and reading messages.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::MessageStore;
use crate::error::{BackendError, ChatError};
use crate::models::input::{CreateChatInput, EditMessageInput, SendMessageInput, StartChatInput, ValidateExt};
use crate::models::{
    Attachment, ChatKind, ChatSummary, ChatUpdate, LastMessage, Message, MessagePatch, NewChat, NewMessage,
};

/// How long after sending a message its author may still edit or delete it.
pub const CHANGE_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Characters of message text kept in a conversation preview.
const PREVIEW_LENGTH: usize = 30;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Shorten message text for the conversation list.
pub fn preview_text(text: &str) -> String {
    if text.chars().count() > PREVIEW_LENGTH {
        let head: String = text.chars().take(PREVIEW_LENGTH).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

pub struct ChatActions<S: MessageStore, C: Clock = SystemClock> {
    store: Arc<S>,
    user_id: String,
    clock: C,
}

impl<S: MessageStore> ChatActions<S, SystemClock> {
    pub fn new(store: Arc<S>, user_id: impl Into<String>) -> Self {
        Self::with_clock(store, user_id, SystemClock)
    }
}

impl<S: MessageStore, C: Clock> ChatActions<S, C> {
    pub fn with_clock(store: Arc<S>, user_id: impl Into<String>, clock: C) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            clock,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Create a direct chat between two different users, one of them the
    /// current user.
    pub async fn create_chat(&self, participants: &[String]) -> Result<ChatSummary, ChatError> {
        let input = CreateChatInput {
            participants: participants.to_vec(),
        };
        input.validate_input()?;
        if input.participants[0] == input.participants[1] {
            return Err(ChatError::Validation("Participants must be different users".to_string()));
        }
        if !input.participants.contains(&self.user_id) {
            return Err(ChatError::Validation("You must be a participant of the chat".to_string()));
        }

        let chat = self
            .store
            .create_chat(NewChat {
                kind: ChatKind::Direct,
                participants: input.participants,
                created_at: self.clock.now_millis(),
            })
            .await?;
        Ok(chat)
    }

    /// Return the direct chat with `friend_id`, creating it on first use.
    pub async fn start_direct_chat(&self, friend_id: &str) -> Result<ChatSummary, ChatError> {
        let input = StartChatInput {
            friend_id: friend_id.to_string(),
        };
        input.validate_input()?;

        let pair = vec![self.user_id.clone(), input.friend_id];
        if let Some(existing) = self.store.find_direct_chat(&pair).await? {
            debug!(chat_id = %existing.id, "Reusing direct chat");
            return Ok(existing);
        }
        self.create_chat(&pair).await
    }

    pub async fn get_chat(&self, conversation_id: &str) -> Result<Option<ChatSummary>, ChatError> {
        Ok(self.store.get_chat(conversation_id).await?)
    }

    /// Send a text message, optionally carrying an image.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        image_url: Option<&str>,
    ) -> Result<Message, ChatError> {
        let input = SendMessageInput {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            image_url: image_url.map(str::to_string),
        };
        input.validate_input()?;
        if input.text.trim().is_empty() && input.image_url.is_none() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }

        let now = self.clock.now_millis();
        let attachments = input
            .image_url
            .as_deref()
            .map(|url| vec![Attachment::image(url, now)])
            .unwrap_or_default();

        self.post(conversation_id, input.text, attachments, now).await
    }

    /// Copy a message's text and attachments into another conversation as a
    /// new message by the current user.
    pub async fn forward_message(
        &self,
        message: &Message,
        target_conversation_id: &str,
    ) -> Result<Message, ChatError> {
        if target_conversation_id.is_empty() {
            return Err(ChatError::Validation("Target conversation is required".to_string()));
        }

        let now = self.clock.now_millis();
        let forwarded = self
            .post(target_conversation_id, message.text.clone(), message.attachments.clone(), now)
            .await?;
        info!(
            from = %message.conversation_id,
            to = %target_conversation_id,
            message_id = %forwarded.id,
            "Forwarded message"
        );
        Ok(forwarded)
    }

    /// Replace the text of one of the user's own recent messages. Returns
    /// `false` when the text is unchanged.
    pub async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
    ) -> Result<bool, ChatError> {
        let input = EditMessageInput {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            text: new_text.to_string(),
        };
        input.validate_input()?;
        if input.text.trim().is_empty() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }

        let message = self.load_own(conversation_id, message_id).await?;
        if self.clock.now_millis() - message.timestamp > CHANGE_WINDOW_MS {
            return Err(ChatError::EditWindowExpired);
        }
        if input.text.trim() == message.text {
            return Ok(false);
        }

        self.store
            .update_message(conversation_id, message_id, MessagePatch::edit(input.text.trim()))
            .await?;
        info!(conversation_id = %conversation_id, message_id = %message_id, "Edited message");
        Ok(true)
    }

    /// Remove one of the user's own recent messages.
    pub async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<(), ChatError> {
        let message = self.load_own(conversation_id, message_id).await?;
        if self.clock.now_millis() - message.timestamp > CHANGE_WINDOW_MS {
            return Err(ChatError::DeleteWindowExpired);
        }

        self.store.remove_message(conversation_id, message_id).await?;
        info!(conversation_id = %conversation_id, message_id = %message_id, "Deleted message");
        Ok(())
    }

    /// Mark other participants' messages as read. Missing ids and the user's
    /// own messages are skipped. Returns how many messages changed.
    pub async fn mark_as_read(&self, conversation_id: &str, message_ids: &[String]) -> Result<usize, ChatError> {
        let mut marked = 0;
        for message_id in message_ids {
            let Some(record) = self.store.get_message(conversation_id, message_id).await? else {
                continue;
            };
            let Some(message) = Message::from_record(conversation_id, &record) else {
                continue;
            };
            if message.sender_id == self.user_id || message.read {
                continue;
            }
            self.store
                .update_message(conversation_id, message_id, MessagePatch::mark_read())
                .await?;
            marked += 1;
        }
        Ok(marked)
    }

    async fn post(
        &self,
        conversation_id: &str,
        text: String,
        attachments: Vec<Attachment>,
        now: i64,
    ) -> Result<Message, ChatError> {
        let preview = LastMessage {
            text: preview_text(&text),
            timestamp: now,
            sender_id: self.user_id.clone(),
        };
        self.store
            .update_chat(
                conversation_id,
                ChatUpdate {
                    last_message: preview,
                    updated_at: now,
                },
            )
            .await
            .map_err(|e| match e {
                BackendError::NotFound(_) => ChatError::ChatNotFound(conversation_id.to_string()),
                other => ChatError::Backend(other),
            })?;

        let message = self
            .store
            .push_message(
                conversation_id,
                NewMessage {
                    sender_id: self.user_id.clone(),
                    text,
                    timestamp: now,
                    attachments,
                },
            )
            .await?;
        info!(conversation_id = %conversation_id, message_id = %message.id, "Sent message");
        Ok(message)
    }

    async fn load_own(&self, conversation_id: &str, message_id: &str) -> Result<Message, ChatError> {
        let record = self
            .store
            .get_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
        let message = Message::from_record(conversation_id, &record)
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;

        if message.sender_id != self.user_id {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                user_id = %self.user_id,
                "Refusing to change another participant's message"
            );
            return Err(ChatError::NotSender);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_text_truncates_long_messages() {
        assert_eq!(preview_text("short"), "short");
        let exact = "a".repeat(30);
        assert_eq!(preview_text(&exact), exact);
        assert_eq!(preview_text(&"b".repeat(31)), format!("{}...", "b".repeat(30)));
    }

    #[test]
    fn test_preview_text_counts_characters() {
        let text = "é".repeat(40);
        let preview = preview_text(&text);
        assert_eq!(preview.chars().count(), 33);
        assert!(preview.ends_with("..."));
    }
}
