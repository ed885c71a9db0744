use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatline::models::NewMessage;
use chatline::{ChatActions, FeedConfig, FeedWindow, MemoryBackend, MessageFeed, MessageStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_USER_ID: &str = "alice";
const DEFAULT_HISTORY: usize = 45;
const DEFAULT_PEER_ID: &str = "bob";
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn wait_for(
    rx: &mut watch::Receiver<FeedWindow>,
    condition: impl FnMut(&FeedWindow) -> bool,
) -> anyhow::Result<FeedWindow> {
    let window = tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(condition))
        .await
        .context("Timed out waiting for the feed")?
        .context("Feed went away")?;
    Ok(FeedWindow::clone(&window))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FeedConfig::from_env()?;
    let user_id = env_or("CHATLINE_USER_ID", DEFAULT_USER_ID);
    let peer_id = env_or("CHATLINE_PEER_ID", DEFAULT_PEER_ID);
    let history = match std::env::var("CHATLINE_HISTORY") {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .context("CHATLINE_HISTORY must be a non-negative integer")?,
        Err(_) => DEFAULT_HISTORY,
    };

    let backend = Arc::new(MemoryBackend::new());
    let me = ChatActions::new(backend.clone(), user_id.as_str());
    let peer = ChatActions::new(backend.clone(), peer_id.as_str());

    let conversation_id = me.start_direct_chat(&peer_id).await?.id;
    let start = chrono::Utc::now().timestamp_millis() - history as i64 * 60_000;
    for i in 0..history {
        let sender_id = if i % 2 == 0 { &user_id } else { &peer_id };
        backend.append(
            &conversation_id,
            NewMessage {
                sender_id: sender_id.clone(),
                text: format!("history message {}", i + 1),
                timestamp: start + i as i64 * 60_000,
                attachments: Vec::new(),
            },
        );
    }
    info!(conversation_id = %conversation_id, history, "Seeded conversation");

    let feed = MessageFeed::new(backend.clone(), config);
    let mut rx = feed.watch();
    let mut notices = feed.notices();
    feed.set_conversation(Some(conversation_id.as_str())).await?;

    let window = wait_for(&mut rx, |w| !w.is_loading()).await?;
    info!(loaded = window.len(), has_more = window.has_more(), "Initial window");

    while feed.has_more() {
        let outcome = feed.load_more().await?;
        info!(?outcome, loaded = feed.window().len(), "Paged back");
    }

    let sent = me.send_message(&conversation_id, "hello from the demo", None).await?;
    let window = wait_for(&mut rx, |w| w.newest().map(|m| m.id.as_str()) == Some(sent.id.as_str())).await?;
    info!(loaded = window.len(), "Live message arrived");

    me.edit_message(&conversation_id, &sent.id, "hello from the demo (edited)").await?;
    wait_for(&mut rx, |w| w.newest().map(|m| m.edited).unwrap_or(false)).await?;
    info!(message_id = %sent.id, "Edit arrived");

    let marked = peer.mark_as_read(&conversation_id, &[sent.id.clone()]).await?;
    info!(marked, "Peer read the message");

    if let Some(chat) = backend.get_chat(&conversation_id).await? {
        if let Some(last) = chat.last_message {
            info!(preview = %last.text, sender_id = %last.sender_id, "Conversation preview");
        }
    }

    feed.set_conversation(None).await?;
    while let Ok(notice) = notices.try_recv() {
        warn!(kind = ?notice.kind, detail = %notice.detail, "{}", notice.message);
    }
    info!(items = feed.window().len(), "Feed closed");
    Ok(())
}
