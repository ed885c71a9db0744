//! Input DTOs with garde validation for chat actions.
//!
//! These structs validate caller data before anything reaches the backend.

use garde::Validate;
use serde::Deserialize;

use crate::error::ChatError;

/// Validation constants
const MAX_CONVERSATION_ID_LENGTH: usize = 256;
const MAX_MESSAGE_ID_LENGTH: usize = 128;
const MAX_USER_ID_LENGTH: usize = 128;
const MAX_MESSAGE_LENGTH: usize = 10000;
const MAX_URL_LENGTH: usize = 2048;

/// Custom validation for image URLs (only http(s) links are accepted)
fn validate_image_url(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        None => Ok(()),
        Some(url) if url.len() > MAX_URL_LENGTH => Err(garde::Error::new("Image URL too long")),
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => Ok(()),
        Some(_) => Err(garde::Error::new("Image URL must be an http(s) link")),
    }
}

/// Input for sending a message, optionally with an image
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_CONVERSATION_ID_LENGTH))]
    pub conversation_id: String,
    #[garde(length(max = MAX_MESSAGE_LENGTH))]
    pub text: String,
    #[garde(custom(validate_image_url))]
    pub image_url: Option<String>,
}

/// Input for editing the text of a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct EditMessageInput {
    #[garde(length(min = 1, max = MAX_CONVERSATION_ID_LENGTH))]
    pub conversation_id: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_ID_LENGTH))]
    pub message_id: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_LENGTH))]
    pub text: String,
}

/// Input for opening a direct chat with another user
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct StartChatInput {
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub friend_id: String,
}

/// Input for creating a direct chat
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct CreateChatInput {
    #[garde(length(min = 2, max = 2), inner(length(min = 1, max = MAX_USER_ID_LENGTH)))]
    pub participants: Vec<String>,
}

/// Helper trait to convert garde validation errors into chat errors
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), ChatError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), ChatError> {
        self.validate()
            .map_err(|e| ChatError::Validation(e.to_string()))
    }
}
