use thiserror::Error;

/// Failures reported by a message backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures surfaced by the message feed. None of them are fatal: the window
/// keeps whatever it had loaded before the failure.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Live subscription for {conversation_id} failed: {source}")]
    Subscription {
        conversation_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Loading older messages for {conversation_id} failed: {source}")]
    Fetch {
        conversation_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Invalid feed configuration: {0}")]
    InvalidConfig(String),
}

/// Failures of the chat actions.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("You can only change your own messages")]
    NotSender,

    #[error("You can only edit messages within 5 minutes of sending them")]
    EditWindowExpired,

    #[error("You can only delete messages within 5 minutes of sending them")]
    DeleteWindowExpired,

    #[error(transparent)]
    Backend(#[from] BackendError),
}
