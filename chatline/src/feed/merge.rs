//! Merge rules for the feed window.
//!
//! Every function here returns a sequence that is ascending by
//! `(timestamp, id)` and holds each id at most once.

use std::collections::HashSet;

use crate::models::{Message, RawRecord};

/// Parse a batch of backend records into an ordered, duplicate-free list.
/// Malformed records are dropped without error.
pub fn normalize_snapshot(conversation_id: &str, records: &[RawRecord]) -> Vec<Message> {
    let mut messages: Vec<Message> = records
        .iter()
        .filter_map(|record| Message::from_record(conversation_id, record))
        .collect();
    sort_and_dedup(&mut messages);
    messages
}

/// Sort ascending and keep the last occurrence of every id.
fn sort_and_dedup(messages: &mut Vec<Message>) {
    let mut seen = HashSet::new();
    messages.reverse();
    messages.retain(|m| seen.insert(m.id.clone()));
    messages.sort_by(|a, b| a.order_cmp(b));
}

/// One delivery of the live query after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSnapshot {
    /// Valid messages, ascending and duplicate-free.
    pub items: Vec<Message>,
    /// Records the backend delivered, malformed ones included.
    pub record_count: usize,
}

impl LiveSnapshot {
    pub fn parse(conversation_id: &str, records: &[RawRecord]) -> Self {
        Self {
            items: normalize_snapshot(conversation_id, records),
            record_count: records.len(),
        }
    }

    /// Whether the backend filled the page. A page that is not full holds the
    /// whole conversation.
    pub fn is_full(&self, page_size: usize) -> bool {
        self.record_count >= page_size
    }
}

/// Whether `incoming` picks up where `existing` ends. When the newest local
/// item is older than the oldest incoming one, messages may have been skipped
/// in between.
pub fn connects(existing: &[Message], incoming: &[Message]) -> bool {
    match (existing.last(), incoming.first()) {
        (Some(newest), Some(oldest_incoming)) => !newest.precedes(oldest_incoming),
        _ => true,
    }
}

/// Fold a live snapshot of the newest `page_size` records into the window.
///
/// A snapshot that is not full is the whole conversation and replaces the
/// window. A full snapshot replaces only the range it covers: local items
/// older than its oldest message are kept, so history loaded page by page
/// survives the live window sliding forward. Fullness counts malformed
/// records too, so dropping one never discards loaded history. A full
/// snapshot that does not connect to the local items replaces the window to
/// avoid a gap.
pub fn merge_live_snapshot(
    existing: &[Message],
    snapshot: LiveSnapshot,
    page_size: usize,
) -> Vec<Message> {
    let full = snapshot.is_full(page_size);
    let mut incoming = snapshot.items;
    sort_and_dedup(&mut incoming);

    if !full {
        return incoming;
    }
    // every record in the live range was malformed
    let Some(floor) = incoming.first() else {
        return existing.to_vec();
    };
    if !connects(existing, &incoming) {
        return incoming;
    }

    let mut merged: Vec<Message> = {
        let live_ids: HashSet<&str> = incoming.iter().map(|m| m.id.as_str()).collect();
        existing
            .iter()
            .filter(|m| m.precedes(floor) && !live_ids.contains(m.id.as_str()))
            .cloned()
            .collect()
    };
    merged.extend(incoming);
    merged
}

/// Prepend the fetched items that are strictly older than the current oldest
/// item. Returns the new sequence and how many fetched items were retained.
pub fn prepend_older(existing: &[Message], fetched: Vec<Message>) -> (Vec<Message>, usize) {
    let mut older: Vec<Message> = match existing.first() {
        Some(oldest) => fetched.into_iter().filter(|m| m.precedes(oldest)).collect(),
        None => fetched,
    };
    sort_and_dedup(&mut older);

    let retained = older.len();
    older.extend(existing.iter().cloned());
    (older, retained)
}
