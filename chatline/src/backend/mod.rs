//! The seam between the feed and the remote chat backend.
//!
//! Reads go through [`MessageSource`], writes through [`MessageStore`]. Both
//! mirror an ordered realtime collection: children are ordered by their
//! `timestamp` field, ties broken by key.

pub mod memory;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::models::{ChatSummary, ChatUpdate, Message, MessagePatch, NewChat, NewMessage, RawRecord};

pub use memory::MemoryBackend;

/// Exclusive upper bound for backward pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: i64,
    pub id: String,
}

impl Cursor {
    pub fn of(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            id: message.id.clone(),
        }
    }

    /// Whether a child ordered at `(timestamp, key)` sorts before this cursor.
    pub fn admits(&self, timestamp: i64, key: &str) -> bool {
        (timestamp, key) < (self.timestamp, self.id.as_str())
    }
}

/// `orderByChild("timestamp")`, optionally `endBefore(cursor)`, then
/// `limitToLast(limit_last)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowQuery {
    pub limit_last: usize,
    pub end_before: Option<Cursor>,
}

impl WindowQuery {
    pub fn latest(limit_last: usize) -> Self {
        Self {
            limit_last,
            end_before: None,
        }
    }

    pub fn before(limit_last: usize, cursor: Cursor) -> Self {
        Self {
            limit_last,
            end_before: Some(cursor),
        }
    }
}

/// One delivery of a live query: the full window, or a failure.
pub type SnapshotResult = Result<Vec<RawRecord>, BackendError>;

/// Live query handle. Yields a full snapshot on every change; dropping it
/// unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SnapshotResult>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SnapshotResult>) -> Self {
        Self { rx }
    }

    /// Create a subscription together with the sender that feeds it.
    pub fn channel() -> (mpsc::UnboundedSender<SnapshotResult>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }
}

impl Stream for Subscription {
    type Item = SnapshotResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Open a live query over a conversation's messages.
    async fn subscribe(
        &self,
        conversation_id: &str,
        query: WindowQuery,
    ) -> Result<Subscription, BackendError>;

    /// Run a query once.
    async fn fetch_once(
        &self,
        conversation_id: &str,
        query: WindowQuery,
    ) -> Result<Vec<RawRecord>, BackendError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Store a new message; the backend assigns its id.
    async fn push_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, BackendError>;

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<RawRecord>, BackendError>;

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<(), BackendError>;

    async fn remove_message(&self, conversation_id: &str, message_id: &str) -> Result<(), BackendError>;

    /// Store a new chat; the backend assigns its id.
    async fn create_chat(&self, chat: NewChat) -> Result<ChatSummary, BackendError>;

    /// The direct chat between exactly these participants, if one exists.
    async fn find_direct_chat(&self, participants: &[String]) -> Result<Option<ChatSummary>, BackendError>;

    /// Set the preview of an existing chat. Unknown chats are `NotFound`.
    async fn update_chat(&self, conversation_id: &str, update: ChatUpdate) -> Result<(), BackendError>;

    async fn get_chat(&self, conversation_id: &str) -> Result<Option<ChatSummary>, BackendError>;
}
