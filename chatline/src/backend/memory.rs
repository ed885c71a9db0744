//! In-process backend used by tests and the demo.
//!
//! Keeps every conversation as a sorted list of records and pushes full
//! query windows to live listeners after each write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{MessageSource, MessageStore, SnapshotResult, Subscription, WindowQuery};
use crate::error::BackendError;
use crate::models::{ChatSummary, ChatUpdate, Message, MessagePatch, NewChat, NewMessage, RawRecord};

struct Listener {
    query: WindowQuery,
    tx: mpsc::UnboundedSender<SnapshotResult>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    /// Children without a numeric timestamp sort first, like null values do.
    timestamp: i64,
    record: RawRecord,
}

impl StoredRecord {
    fn new(record: RawRecord) -> Self {
        let timestamp = record
            .value
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or(i64::MIN);
        Self { timestamp, record }
    }
}

pub struct MemoryBackend {
    /// conversation_id -> records sorted by (timestamp, key)
    records: DashMap<String, Vec<StoredRecord>>,
    /// conversation_id -> live listeners
    listeners: DashMap<String, Vec<Listener>>,
    /// chat_id -> chat node as stored, camelCase JSON
    chats: DashMap<String, Value>,
    next_key: AtomicU64,
    fail_next_fetch: AtomicBool,
    deny_subscriptions: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            listeners: DashMap::new(),
            chats: DashMap::new(),
            next_key: AtomicU64::new(1),
            fail_next_fetch: AtomicBool::new(false),
            deny_subscriptions: AtomicBool::new(false),
        }
    }

    /// Generate a key that sorts after every key generated before it.
    fn generate_key(&self) -> String {
        let n = self.next_key.fetch_add(1, Ordering::Relaxed);
        format!("-m{:012}", n)
    }

    fn generate_chat_key(&self) -> String {
        let n = self.next_key.fetch_add(1, Ordering::Relaxed);
        format!("-c{:012}", n)
    }

    /// Store an arbitrary chat node, replacing any node with the same id.
    pub fn insert_raw_chat(&self, chat_id: &str, value: Value) {
        self.chats.insert(chat_id.to_string(), value);
    }

    /// Store a message synchronously and notify listeners.
    pub fn append(&self, conversation_id: &str, message: NewMessage) -> Message {
        let message = Message {
            id: self.generate_key(),
            conversation_id: conversation_id.to_string(),
            sender_id: message.sender_id,
            text: message.text,
            timestamp: message.timestamp,
            read: false,
            edited: false,
            attachments: message.attachments,
        };
        self.insert_raw(conversation_id, message.to_record());
        message
    }

    /// Store an arbitrary record, replacing any record with the same key.
    pub fn insert_raw(&self, conversation_id: &str, record: RawRecord) {
        {
            let mut entry = self.records.entry(conversation_id.to_string()).or_default();
            entry.retain(|stored| stored.record.key != record.key);
            let stored = StoredRecord::new(record);
            let pos = entry.partition_point(|s| {
                (s.timestamp, s.record.key.as_str()) < (stored.timestamp, stored.record.key.as_str())
            });
            entry.insert(pos, stored);
        }
        self.notify(conversation_id);
    }

    /// Number of records stored for a conversation, malformed ones included.
    pub fn record_count(&self, conversation_id: &str) -> usize {
        self.records
            .get(conversation_id)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Number of live listeners still attached to a conversation.
    pub fn listener_count(&self, conversation_id: &str) -> usize {
        self.listeners
            .get(conversation_id)
            .map(|listeners| listeners.iter().filter(|l| !l.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Make the next `fetch_once` call fail.
    pub fn fail_next_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    /// Reject new subscriptions while set.
    pub fn deny_subscriptions(&self, deny: bool) {
        self.deny_subscriptions.store(deny, Ordering::SeqCst);
    }

    /// Deliver an error to every live listener of a conversation.
    pub fn break_listeners(&self, conversation_id: &str, reason: &str) {
        if let Some(listeners) = self.listeners.get(conversation_id) {
            for listener in listeners.iter() {
                let _ = listener
                    .tx
                    .send(Err(BackendError::Unavailable(reason.to_string())));
            }
        }
    }

    fn window(records: &[StoredRecord], query: &WindowQuery) -> Vec<RawRecord> {
        let end = match &query.end_before {
            Some(cursor) => {
                records.partition_point(|s| cursor.admits(s.timestamp, &s.record.key))
            }
            None => records.len(),
        };
        let start = end.saturating_sub(query.limit_last);
        records[start..end].iter().map(|s| s.record.clone()).collect()
    }

    fn query(&self, conversation_id: &str, query: &WindowQuery) -> Vec<RawRecord> {
        self.records
            .get(conversation_id)
            .map(|records| Self::window(&records, query))
            .unwrap_or_default()
    }

    /// Push the current window to every listener, pruning closed ones.
    fn notify(&self, conversation_id: &str) {
        let Some(mut listeners) = self.listeners.get_mut(conversation_id) else {
            return;
        };
        listeners.retain(|l| !l.tx.is_closed());
        for listener in listeners.iter() {
            let snapshot = self.query(conversation_id, &listener.query);
            let _ = listener.tx.send(Ok(snapshot));
        }
        debug!(
            conversation_id = %conversation_id,
            listeners = listeners.len(),
            "Notified live listeners"
        );
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for MemoryBackend {
    async fn subscribe(
        &self,
        conversation_id: &str,
        query: WindowQuery,
    ) -> Result<Subscription, BackendError> {
        if self.deny_subscriptions.load(Ordering::SeqCst) {
            return Err(BackendError::PermissionDenied);
        }

        let (tx, subscription) = Subscription::channel();

        // Holding the listener entry while taking the initial snapshot keeps a
        // concurrent writer's notification from overtaking it.
        let mut listeners = self.listeners.entry(conversation_id.to_string()).or_default();
        let initial = self.query(conversation_id, &query);
        let _ = tx.send(Ok(initial));
        listeners.push(Listener { query, tx });

        info!(conversation_id = %conversation_id, "Live listener attached");
        Ok(subscription)
    }

    async fn fetch_once(
        &self,
        conversation_id: &str,
        query: WindowQuery,
    ) -> Result<Vec<RawRecord>, BackendError> {
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected fetch failure".to_string()));
        }
        Ok(self.query(conversation_id, &query))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn push_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message, BackendError> {
        Ok(self.append(conversation_id, message))
    }

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<RawRecord>, BackendError> {
        Ok(self.records.get(conversation_id).and_then(|records| {
            records
                .iter()
                .find(|s| s.record.key == message_id)
                .map(|s| s.record.clone())
        }))
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<(), BackendError> {
        {
            let mut records = self
                .records
                .get_mut(conversation_id)
                .ok_or_else(|| BackendError::NotFound(message_id.to_string()))?;
            let stored = records
                .iter_mut()
                .find(|s| s.record.key == message_id)
                .ok_or_else(|| BackendError::NotFound(message_id.to_string()))?;
            patch.apply(&mut stored.record.value);
        }
        self.notify(conversation_id);
        Ok(())
    }

    async fn remove_message(&self, conversation_id: &str, message_id: &str) -> Result<(), BackendError> {
        let removed = self
            .records
            .get_mut(conversation_id)
            .map(|mut records| {
                let before = records.len();
                records.retain(|s| s.record.key != message_id);
                records.len() != before
            })
            .unwrap_or(false);

        if !removed {
            return Err(BackendError::NotFound(message_id.to_string()));
        }
        self.notify(conversation_id);
        Ok(())
    }

    async fn create_chat(&self, chat: NewChat) -> Result<ChatSummary, BackendError> {
        let summary = ChatSummary {
            id: self.generate_chat_key(),
            kind: chat.kind,
            participants: chat.participants,
            last_message: None,
            created_at: chat.created_at,
            updated_at: chat.created_at,
        };
        self.chats
            .insert(summary.id.clone(), serde_json::to_value(&summary)?);
        info!(chat_id = %summary.id, participants = summary.participants.len(), "Created chat");
        Ok(summary)
    }

    async fn find_direct_chat(&self, participants: &[String]) -> Result<Option<ChatSummary>, BackendError> {
        let nodes: Vec<Value> = self.chats.iter().map(|entry| entry.value().clone()).collect();

        let mut found: Option<ChatSummary> = None;
        for node in nodes {
            let chat: ChatSummary = serde_json::from_value(node)?;
            if !chat.is_direct_between(participants) {
                continue;
            }
            // the oldest chat wins when duplicates exist
            let older = found
                .as_ref()
                .map(|f| (chat.created_at, &chat.id) < (f.created_at, &f.id))
                .unwrap_or(true);
            if older {
                found = Some(chat);
            }
        }
        Ok(found)
    }

    async fn update_chat(&self, conversation_id: &str, update: ChatUpdate) -> Result<(), BackendError> {
        let last_message = serde_json::to_value(&update.last_message)?;
        let mut node = self
            .chats
            .get_mut(conversation_id)
            .ok_or_else(|| BackendError::NotFound(conversation_id.to_string()))?;
        let data = node
            .as_object_mut()
            .ok_or_else(|| BackendError::Unavailable(format!("chat {} is not an object", conversation_id)))?;
        data.insert("lastMessage".to_string(), last_message);
        data.insert("updatedAt".to_string(), json!(update.updated_at));
        Ok(())
    }

    async fn get_chat(&self, conversation_id: &str) -> Result<Option<ChatSummary>, BackendError> {
        let Some(node) = self.chats.get(conversation_id).map(|node| node.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(node)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Cursor;
    use futures_util::StreamExt;
    use crate::models::{ChatKind, LastMessage};
    use serde_json::json;

    fn new_message(sender: &str, timestamp: i64) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            text: format!("at {}", timestamp),
            timestamp,
            attachments: Vec::new(),
        }
    }

    fn seeded(count: i64) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for ts in 1..=count {
            backend.append("chat1", new_message("alice", ts));
        }
        backend
    }

    fn timestamps(records: &[RawRecord]) -> Vec<i64> {
        records
            .iter()
            .map(|r| r.value["timestamp"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_generated_keys_sort_in_insertion_order() {
        let backend = MemoryBackend::new();
        let keys: Vec<String> = (0..15).map(|_| backend.generate_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_limit_to_last() {
        let backend = seeded(45);
        let records = backend.fetch_once("chat1", WindowQuery::latest(20)).await.unwrap();
        assert_eq!(timestamps(&records), (26..=45).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_end_before_cursor() {
        let backend = seeded(45);
        let latest = backend.fetch_once("chat1", WindowQuery::latest(20)).await.unwrap();
        let oldest = Message::from_record("chat1", &latest[0]).unwrap();

        let older = backend
            .fetch_once("chat1", WindowQuery::before(20, Cursor::of(&oldest)))
            .await
            .unwrap();
        assert_eq!(timestamps(&older), (6..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_records_sorted_by_timestamp_not_insertion() {
        let backend = MemoryBackend::new();
        backend.append("chat1", new_message("alice", 30));
        backend.append("chat1", new_message("alice", 10));
        backend.append("chat1", new_message("alice", 20));

        let records = backend.fetch_once("chat1", WindowQuery::latest(10)).await.unwrap();
        assert_eq!(timestamps(&records), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_subscription_gets_initial_and_live_snapshots() {
        let backend = seeded(3);
        let mut sub = backend.subscribe("chat1", WindowQuery::latest(2)).await.unwrap();

        let initial = sub.next().await.unwrap().unwrap();
        assert_eq!(timestamps(&initial), vec![2, 3]);

        backend.append("chat1", new_message("bob", 4));
        let live = sub.next().await.unwrap().unwrap();
        assert_eq!(timestamps(&live), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let backend = seeded(1);
        let sub = backend.subscribe("chat1", WindowQuery::latest(5)).await.unwrap();
        assert_eq!(backend.listener_count("chat1"), 1);

        drop(sub);
        assert_eq!(backend.listener_count("chat1"), 0);

        backend.append("chat1", new_message("alice", 2));
        assert!(backend.listeners.get("chat1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let backend = MemoryBackend::new();
        let msg = backend.append("chat1", new_message("alice", 5));

        backend
            .update_message("chat1", &msg.id, MessagePatch::edit("changed"))
            .await
            .unwrap();
        let stored = backend.get_message("chat1", &msg.id).await.unwrap().unwrap();
        assert_eq!(stored.value["text"], "changed");
        assert_eq!(stored.value["edited"], true);

        backend.remove_message("chat1", &msg.id).await.unwrap();
        assert!(backend.get_message("chat1", &msg.id).await.unwrap().is_none());
        assert!(matches!(
            backend.remove_message("chat1", &msg.id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = seeded(2);
        backend.fail_next_fetch();
        assert!(backend.fetch_once("chat1", WindowQuery::latest(5)).await.is_err());
        assert!(backend.fetch_once("chat1", WindowQuery::latest(5)).await.is_ok());

        backend.deny_subscriptions(true);
        assert!(matches!(
            backend.subscribe("chat1", WindowQuery::latest(5)).await,
            Err(BackendError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_malformed_records_are_stored_first() {
        let backend = seeded(2);
        backend.insert_raw("chat1", RawRecord::new("-broken", json!({"text": "no sender"})));

        let records = backend.fetch_once("chat1", WindowQuery::latest(10)).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, "-broken");
        assert_eq!(backend.record_count("chat1"), 3);
    }

    fn direct(a: &str, b: &str, created_at: i64) -> NewChat {
        NewChat {
            kind: ChatKind::Direct,
            participants: vec![a.to_string(), b.to_string()],
            created_at,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_direct_chat() {
        let backend = MemoryBackend::new();
        let created = backend.create_chat(direct("alice", "bob", 100)).await.unwrap();
        assert!(created.id.starts_with("-c"));
        assert_eq!(created.updated_at, 100);
        backend.create_chat(direct("alice", "carol", 110)).await.unwrap();

        let pair = vec!["bob".to_string(), "alice".to_string()];
        let found = backend.find_direct_chat(&pair).await.unwrap().unwrap();
        assert_eq!(found, created);

        let missing = vec!["bob".to_string(), "carol".to_string()];
        assert!(backend.find_direct_chat(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_chat_requires_existing_chat() {
        let backend = MemoryBackend::new();
        let update = ChatUpdate {
            last_message: LastMessage {
                text: "hi".to_string(),
                timestamp: 200,
                sender_id: "alice".to_string(),
            },
            updated_at: 200,
        };
        assert!(matches!(
            backend.update_chat("-nochat", update.clone()).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(backend.get_chat("-nochat").await.unwrap().is_none());

        let chat = backend.create_chat(direct("alice", "bob", 100)).await.unwrap();
        backend.update_chat(&chat.id, update.clone()).await.unwrap();
        let stored = backend.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(stored.last_message, Some(update.last_message));
        assert_eq!(stored.created_at, 100);
        assert_eq!(stored.updated_at, 200);
    }

    #[tokio::test]
    async fn test_corrupt_chat_node_is_a_serialization_error() {
        let backend = MemoryBackend::new();
        backend.insert_raw_chat("-c1", json!({"id": "-c1", "type": "direct", "participants": "alice"}));

        assert!(matches!(
            backend.get_chat("-c1").await,
            Err(BackendError::Serialization(_))
        ));
        let pair = vec!["alice".to_string(), "bob".to_string()];
        assert!(matches!(
            backend.find_direct_chat(&pair).await,
            Err(BackendError::Serialization(_))
        ));
    }
}
