//! Windowed live message feed.
//!
//! A [`MessageFeed`] shows the newest page of one conversation, keeps it in
//! sync through a live subscription and extends it backwards on demand.

pub mod merge;
mod window;

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{MessageSource, Subscription, WindowQuery};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::models::Message;

pub use merge::{merge_live_snapshot, normalize_snapshot, prepend_older, LiveSnapshot};
pub use window::FeedWindow;

use window::FetchApplied;

/// Capacity of the notice channel; slow receivers lose the oldest notices.
const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Subscription,
    Fetch,
}

/// A non-fatal, user-visible failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedNotice {
    pub kind: NoticeKind,
    pub conversation_id: String,
    /// Short text meant for a toast.
    pub message: String,
    pub detail: String,
}

impl FeedNotice {
    fn new(kind: NoticeKind, conversation_id: &str, detail: String) -> Self {
        let message = match kind {
            NoticeKind::Subscription => "Error loading messages",
            NoticeKind::Fetch => "Failed to load older messages",
        };
        Self {
            kind,
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Preconditions not met; nothing was fetched.
    Skipped,
    /// The page was prepended.
    Loaded { retained: usize },
    /// The conversation changed, or the window moved, while fetching; the
    /// page was thrown away.
    Discarded,
}

pub struct MessageFeed<S: MessageSource> {
    source: Arc<S>,
    config: FeedConfig,
    window: Arc<watch::Sender<FeedWindow>>,
    notices: broadcast::Sender<FeedNotice>,
    live_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: MessageSource> MessageFeed<S> {
    pub fn new(source: Arc<S>, config: FeedConfig) -> Self {
        let (window, _) = watch::channel(FeedWindow::new(config.page_size));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            source,
            config,
            window: Arc::new(window),
            notices,
            live_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Copy of the current window.
    pub fn window(&self) -> FeedWindow {
        self.window.borrow().clone()
    }

    /// Receiver notified after every change of the window.
    pub fn watch(&self) -> watch::Receiver<FeedWindow> {
        self.window.subscribe()
    }

    /// Receiver for failure notices.
    pub fn notices(&self) -> broadcast::Receiver<FeedNotice> {
        self.notices.subscribe()
    }

    pub fn items(&self) -> Vec<Message> {
        self.window.borrow().items().to_vec()
    }

    pub fn has_more(&self) -> bool {
        self.window.borrow().has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.window.borrow().is_loading()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.window.borrow().conversation_id().map(str::to_string)
    }

    /// Switch the feed to another conversation, or close it with `None`.
    /// Passing the id that is already open and live does nothing.
    ///
    /// A failed subscription leaves an empty, idle window and is reported both
    /// as a notice and as the returned error. Calling again with the same id
    /// retries.
    pub async fn set_conversation(&self, conversation_id: Option<&str>) -> Result<(), FeedError> {
        let unchanged = self.window.borrow().conversation_id() == conversation_id;
        if unchanged && (conversation_id.is_none() || self.is_live()) {
            return Ok(());
        }

        self.close();

        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };

        let mut epoch = 0;
        self.window.send_modify(|w| epoch = w.open(conversation_id));
        info!(
            conversation_id = %conversation_id,
            page_size = self.config.page_size,
            "Opening message feed"
        );

        let query = WindowQuery::latest(self.config.page_size);
        let subscription = match self.source.subscribe(conversation_id, query).await {
            Ok(subscription) => subscription,
            Err(source) => {
                self.window
                    .send_if_modified(|w| w.apply_subscription_error(epoch));
                let err = FeedError::Subscription {
                    conversation_id: conversation_id.to_string(),
                    source,
                };
                self.report(NoticeKind::Subscription, conversation_id, &err);
                return Err(err);
            }
        };

        // The epoch check and the slot update happen under the slot lock, the
        // same lock `close` holds while it closes the window.
        let mut slot = self.task_slot();
        if self.window.borrow().epoch() != epoch {
            // Replaced while subscribing; dropping the subscription detaches it.
            debug!(conversation_id = %conversation_id, "Discarding stale subscription");
            return Ok(());
        }

        let handle = tokio::spawn(run_live(
            subscription,
            conversation_id.to_string(),
            epoch,
            self.window.clone(),
            self.notices.clone(),
        ));
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop the live subscription and clear the window.
    pub fn close(&self) {
        let mut slot = self.task_slot();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        if self.window.send_if_modified(|w| w.close()) {
            info!("Closed message feed");
        }
    }

    /// Load the page of messages just before the oldest loaded one.
    ///
    /// Does nothing unless a conversation is open, something is loaded,
    /// `has_more` is set and no load is in flight.
    pub async fn load_more(&self) -> Result<LoadOutcome, FeedError> {
        let mut ticket = None;
        self.window.send_if_modified(|w| {
            ticket = w.begin_fetch();
            ticket.is_some()
        });
        let Some(ticket) = ticket else {
            return Ok(LoadOutcome::Skipped);
        };

        debug!(
            conversation_id = %ticket.conversation_id,
            before = ticket.cursor.timestamp,
            "Loading older messages"
        );

        let query = WindowQuery::before(self.config.page_size, ticket.cursor.clone());
        match self.source.fetch_once(&ticket.conversation_id, query).await {
            Ok(records) => {
                let fetched = normalize_snapshot(&ticket.conversation_id, &records);
                let mut applied = FetchApplied::Stale;
                self.window.send_if_modified(|w| {
                    applied = w.finish_fetch(&ticket, fetched);
                    applied != FetchApplied::Stale
                });

                match applied {
                    FetchApplied::Prepended(retained) => {
                        info!(
                            conversation_id = %ticket.conversation_id,
                            retained,
                            has_more = self.has_more(),
                            "Loaded older messages"
                        );
                        Ok(LoadOutcome::Loaded { retained })
                    }
                    FetchApplied::Moved => {
                        debug!(
                            conversation_id = %ticket.conversation_id,
                            "Window moved while loading; dropping older page"
                        );
                        Ok(LoadOutcome::Discarded)
                    }
                    FetchApplied::Stale => Ok(LoadOutcome::Discarded),
                }
            }
            Err(source) => {
                let current = self.window.send_if_modified(|w| w.fail_fetch(ticket.epoch));
                let err = FeedError::Fetch {
                    conversation_id: ticket.conversation_id.clone(),
                    source,
                };
                if current {
                    self.report(NoticeKind::Fetch, &ticket.conversation_id, &err);
                }
                Err(err)
            }
        }
    }

    /// Whether a live subscription task is still running.
    fn is_live(&self) -> bool {
        self.task_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn report(&self, kind: NoticeKind, conversation_id: &str, err: &FeedError) {
        warn!(conversation_id = %conversation_id, error = %err, "Message feed failure");
        let _ = self
            .notices
            .send(FeedNotice::new(kind, conversation_id, err.to_string()));
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.live_task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: MessageSource> Drop for MessageFeed<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.task_slot().take() {
            handle.abort();
        }
    }
}

/// Apply live snapshots to the window until the subscription ends or the
/// window moves on to another epoch.
async fn run_live(
    mut subscription: Subscription,
    conversation_id: String,
    epoch: u64,
    window: Arc<watch::Sender<FeedWindow>>,
    notices: broadcast::Sender<FeedNotice>,
) {
    while let Some(event) = subscription.next().await {
        match event {
            Ok(records) => {
                let snapshot = LiveSnapshot::parse(&conversation_id, &records);
                let delivered = snapshot.items.len();
                if !window.send_if_modified(|w| w.apply_snapshot(epoch, snapshot)) {
                    break;
                }
                debug!(
                    conversation_id = %conversation_id,
                    delivered,
                    dropped = records.len() - delivered,
                    "Applied live snapshot"
                );
            }
            Err(e) => {
                if !window.send_if_modified(|w| w.apply_subscription_error(epoch)) {
                    break;
                }
                warn!(conversation_id = %conversation_id, error = %e, "Live subscription error");
                let err = FeedError::Subscription {
                    conversation_id: conversation_id.clone(),
                    source: e,
                };
                let _ = notices.send(FeedNotice::new(
                    NoticeKind::Subscription,
                    &conversation_id,
                    err.to_string(),
                ));
            }
        }
    }
    debug!(conversation_id = %conversation_id, "Live subscription ended");
}
