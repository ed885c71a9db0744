//! Windowed live message feed for real-time chat clients.
//!
//! The feed reads from any backend implementing [`backend::MessageSource`];
//! [`backend::MemoryBackend`] is a complete in-process implementation.

pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod feed;
pub mod models;

pub use backend::{MemoryBackend, MessageSource, MessageStore};
pub use chat::ChatActions;
pub use config::FeedConfig;
pub use error::{BackendError, ChatError, FeedError};
pub use feed::{FeedNotice, FeedWindow, LoadOutcome, MessageFeed, NoticeKind};
pub use models::Message;
