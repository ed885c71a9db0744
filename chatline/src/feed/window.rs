use crate::backend::Cursor;
use crate::models::Message;

use super::merge::{connects, merge_live_snapshot, prepend_older, LiveSnapshot};

/// Local view of one open conversation.
///
/// Every mutation carries the epoch it was started under; a mismatch means
/// the conversation was closed or replaced meanwhile and the mutation is
/// refused.
#[derive(Debug, Clone)]
pub struct FeedWindow {
    conversation_id: Option<String>,
    items: Vec<Message>,
    page_size: usize,
    has_more: bool,
    epoch: u64,
    initial_pending: bool,
    fetch_in_flight: bool,
    /// Set once a backward fetch came back short.
    history_exhausted: bool,
}

/// What happened to a fetched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchApplied {
    /// The conversation was closed or replaced; nothing changed.
    Stale,
    /// The oldest item is no longer the one the fetch started from, most
    /// likely because a live snapshot rebased the window. The page was
    /// dropped and the fetch slot released.
    Moved,
    /// The page was prepended; holds the number of retained items.
    Prepended(usize),
}

/// Handed out when a backward fetch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchTicket {
    pub epoch: u64,
    pub conversation_id: String,
    pub cursor: Cursor,
}

impl FeedWindow {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            conversation_id: None,
            items: Vec::new(),
            page_size,
            has_more: false,
            epoch: 0,
            initial_pending: false,
            fetch_in_flight: false,
            history_exhausted: false,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.initial_pending || self.fetch_in_flight
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.items.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.items.last()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.conversation_id.is_some()
    }

    /// Start a fresh window for `conversation_id`. Returns the new epoch.
    pub(crate) fn open(&mut self, conversation_id: &str) -> u64 {
        self.reset();
        self.conversation_id = Some(conversation_id.to_string());
        self.initial_pending = true;
        self.epoch
    }

    /// Discard all state. Returns whether anything was open.
    pub(crate) fn close(&mut self) -> bool {
        let was_open = self.conversation_id.is_some();
        self.reset();
        was_open
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.conversation_id = None;
        self.items.clear();
        self.has_more = false;
        self.initial_pending = false;
        self.fetch_in_flight = false;
        self.history_exhausted = false;
    }

    pub(crate) fn apply_snapshot(&mut self, epoch: u64, snapshot: LiveSnapshot) -> bool {
        if !self.is_current(epoch) {
            return false;
        }

        let full = snapshot.is_full(self.page_size);
        if full && !snapshot.items.is_empty() && !connects(&self.items, &snapshot.items) {
            self.history_exhausted = false;
        }

        self.items = merge_live_snapshot(&self.items, snapshot, self.page_size);
        self.has_more = full && !self.history_exhausted;
        self.initial_pending = false;
        true
    }

    pub(crate) fn apply_subscription_error(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.initial_pending = false;
        true
    }

    /// Claim the backward fetch slot. `None` when a fetch must not start.
    pub(crate) fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if !self.has_more || self.is_loading() {
            return None;
        }
        let conversation_id = self.conversation_id.clone()?;
        let cursor = Cursor::of(self.items.first()?);

        self.fetch_in_flight = true;
        Some(FetchTicket {
            epoch: self.epoch,
            conversation_id,
            cursor,
        })
    }

    /// Prepend a fetched page, provided the window still starts at the
    /// ticket's cursor.
    pub(crate) fn finish_fetch(&mut self, ticket: &FetchTicket, fetched: Vec<Message>) -> FetchApplied {
        if !self.is_current(ticket.epoch) {
            return FetchApplied::Stale;
        }
        self.fetch_in_flight = false;

        if self.items.first().map(Cursor::of).as_ref() != Some(&ticket.cursor) {
            return FetchApplied::Moved;
        }

        let (items, retained) = prepend_older(&self.items, fetched);
        self.items = items;
        self.has_more = retained == self.page_size;
        if !self.has_more {
            self.history_exhausted = true;
        }
        FetchApplied::Prepended(retained)
    }

    pub(crate) fn fail_fetch(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.fetch_in_flight = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: i64) -> Message {
        Message {
            id: format!("-m{:04}", ts),
            conversation_id: "chat1".to_string(),
            sender_id: "alice".to_string(),
            text: String::new(),
            timestamp: ts,
            read: false,
            edited: false,
            attachments: Vec::new(),
        }
    }

    fn range(from: i64, to: i64) -> Vec<Message> {
        (from..=to).map(msg).collect()
    }

    fn live(items: Vec<Message>) -> LiveSnapshot {
        LiveSnapshot {
            record_count: items.len(),
            items,
        }
    }

    fn opened(page_size: usize) -> (FeedWindow, u64) {
        let mut window = FeedWindow::new(page_size);
        let epoch = window.open("chat1");
        (window, epoch)
    }

    #[test]
    fn test_open_marks_loading() {
        let (window, _) = opened(20);
        assert!(window.is_loading());
        assert!(!window.has_more());
        assert_eq!(window.conversation_id(), Some("chat1"));
        assert_eq!(window.page_size(), 20);
    }

    #[test]
    fn test_has_more_follows_snapshot_size() {
        let (mut window, epoch) = opened(20);
        assert!(window.apply_snapshot(epoch, live(range(26, 45))));
        assert!(window.has_more());
        assert!(!window.is_loading());

        let (mut window, epoch) = opened(20);
        window.apply_snapshot(epoch, live(range(1, 7)));
        assert!(!window.has_more());
        assert_eq!(window.len(), 7);
    }

    #[test]
    fn test_stale_epoch_is_refused() {
        let (mut window, epoch) = opened(20);
        window.close();
        assert!(!window.apply_snapshot(epoch, live(range(1, 3))));
        assert!(!window.apply_subscription_error(epoch));
        assert!(window.is_empty());

        let new_epoch = window.open("chat2");
        assert_ne!(epoch, new_epoch);
        assert!(!window.apply_snapshot(epoch, live(range(1, 3))));
        assert!(window.is_empty());
        assert!(window.is_loading());
    }

    #[test]
    fn test_begin_fetch_guards() {
        // still loading the first snapshot
        let (mut window, epoch) = opened(5);
        assert!(window.begin_fetch().is_none());

        // nothing older
        window.apply_snapshot(epoch, live(range(1, 3)));
        assert!(window.begin_fetch().is_none());

        // already fetching
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(6, 10)));
        let ticket = window.begin_fetch().unwrap();
        assert_eq!(ticket.cursor.timestamp, 6);
        assert!(window.is_loading());
        assert!(window.begin_fetch().is_none());
    }

    #[test]
    fn test_finish_fetch_prepends_and_updates_has_more() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(11, 15)));

        let ticket = window.begin_fetch().unwrap();
        assert_eq!(window.finish_fetch(&ticket, range(6, 10)), FetchApplied::Prepended(5));
        assert!(window.has_more());
        assert_eq!(window.oldest().unwrap().timestamp, 6);

        let ticket = window.begin_fetch().unwrap();
        assert_eq!(window.finish_fetch(&ticket, range(1, 5).split_off(2)), FetchApplied::Prepended(3));
        assert!(!window.has_more());
        assert!(!window.is_loading());
        assert_eq!(window.len(), 13);
    }

    #[test]
    fn test_zero_retained_ends_pagination() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(11, 15)));

        let ticket = window.begin_fetch().unwrap();
        // the backend handed back the same newest page
        assert_eq!(window.finish_fetch(&ticket, range(11, 15)), FetchApplied::Prepended(0));
        assert!(!window.has_more());
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_exhausted_history_stays_exhausted_across_live_updates() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(4, 8)));
        let ticket = window.begin_fetch().unwrap();
        window.finish_fetch(&ticket, range(1, 3));
        assert!(!window.has_more());

        window.apply_snapshot(epoch, live(range(5, 9)));
        assert!(!window.has_more());
        assert_eq!(window.len(), 9);
    }

    #[test]
    fn test_fetch_after_rebase_is_dropped() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(11, 15)));
        let ticket = window.begin_fetch().unwrap();

        // a disconnected live page lands while the fetch is in flight
        window.apply_snapshot(epoch, live(range(31, 35)));
        assert_eq!(window.finish_fetch(&ticket, range(6, 10)), FetchApplied::Moved);

        assert_eq!(window.oldest().unwrap().timestamp, 31);
        assert_eq!(window.len(), 5);
        assert!(window.has_more());
        assert!(!window.is_loading());
    }

    #[test]
    fn test_fetch_for_closed_window_is_stale() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(11, 15)));
        let ticket = window.begin_fetch().unwrap();

        window.open("chat2");
        assert_eq!(window.finish_fetch(&ticket, range(6, 10)), FetchApplied::Stale);
        assert!(window.is_empty());
    }

    #[test]
    fn test_failed_fetch_keeps_state() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(11, 15)));
        let ticket = window.begin_fetch().unwrap();

        assert!(window.fail_fetch(ticket.epoch));
        assert!(window.has_more());
        assert!(!window.is_loading());
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_close_resets_everything() {
        let (mut window, epoch) = opened(5);
        window.apply_snapshot(epoch, live(range(1, 5)));
        window.begin_fetch();

        assert!(window.close());
        assert!(window.is_empty());
        assert!(!window.has_more());
        assert!(!window.is_loading());
        assert_eq!(window.conversation_id(), None);
        assert!(!window.close());
    }
}
