//! Session façade: opens conversations, sends messages, and keeps the
//! open view fresh, hiding whether push or poll is currently
//! authoritative.
//!
//! One conversation view is live at a time. Opening a new one tears the
//! previous view down: its push subscriptions are removed, its poll and
//! catch-up tasks aborted, and any in-flight fetch for it invalidated by
//! sequence number so a late response cannot resurrect stale data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parley_net::{ChannelError, PushChannel, SubscriptionId};
use parley_shared::constants::{DIRECTORY_PAGE_SIZE, HISTORY_PAGE_SIZE, POLL_INTERVAL_SECS};
use parley_shared::protocol::{ClientEvent, EventKind, ServerEvent};
use parley_shared::types::{ConnectionState, ConversationId, Message, UserId};

use crate::error::SessionError;
use crate::profiles::ProfileCache;
use crate::services::{ChatBackend, DirectoryPage, ServiceResult};
use crate::timeline::Timeline;
use crate::typing::{TypingConfig, TypingTracker};

/// Freshness and backstop tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backstop poll period while a conversation is open. Closes the gap
    /// whenever push delivery is silently degraded.
    pub poll_interval: Duration,
    /// Page size for the initial load and refresh fetches.
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            page_size: HISTORY_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub sync: SyncConfig,
    pub typing: TypingConfig,
}

/// State of the currently open conversation view.
struct ActiveView {
    conversation: ConversationId,
    timeline: Arc<Mutex<Timeline>>,
    subscriptions: Vec<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
    /// FIFO gate: one submission in flight per conversation; later sends
    /// queue behind it in order.
    send_gate: Arc<AsyncMutex<()>>,
    /// Last-writer-wins guard for refresh fetches.
    fetch_seq: Arc<AtomicU64>,
}

/// The single entry point the rest of the product calls for messaging.
pub struct ChatSession {
    local_user: UserId,
    channel: Arc<PushChannel>,
    backend: Arc<dyn ChatBackend>,
    typing: Arc<TypingTracker>,
    typing_subscriptions: Vec<SubscriptionId>,
    profiles: ProfileCache<dyn ChatBackend>,
    config: SyncConfig,
    active: Mutex<Option<ActiveView>>,
    terminal: AsyncMutex<mpsc::Receiver<ChannelError>>,
}

impl ChatSession {
    /// Build a session around an owned push channel and a backend.
    ///
    /// `terminal_rx` is the receiver returned by [`PushChannel::new`];
    /// the session folds its terminal errors into
    /// [`SessionError::SessionExpired`].
    pub fn new(
        local_user: UserId,
        channel: Arc<PushChannel>,
        terminal_rx: mpsc::Receiver<ChannelError>,
        backend: Arc<dyn ChatBackend>,
        config: SessionConfig,
    ) -> Self {
        let typing = Arc::new(TypingTracker::new(
            channel.clone(),
            local_user.clone(),
            config.typing,
        ));

        // Typing signals are session-wide; message feeds are wired per
        // open view in `open_conversation`.
        let mut typing_subscriptions = Vec::new();
        let tracker = typing.clone();
        typing_subscriptions.push(channel.subscribe(EventKind::TypingStart, move |event| {
            if let ServerEvent::TypingStart {
                conversation_id,
                user_id,
            } = event
            {
                tracker.on_remote_start(conversation_id, user_id);
            }
        }));
        let tracker = typing.clone();
        typing_subscriptions.push(channel.subscribe(EventKind::TypingStop, move |event| {
            if let ServerEvent::TypingStop {
                conversation_id,
                user_id,
            } = event
            {
                tracker.on_remote_stop(conversation_id, user_id);
            }
        }));

        let profiles = ProfileCache::new(backend.clone());

        Self {
            local_user,
            channel,
            backend,
            typing,
            typing_subscriptions,
            profiles,
            config: config.sync,
            active: Mutex::new(None),
            terminal: AsyncMutex::new(terminal_rx),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn profiles(&self) -> &ProfileCache<dyn ChatBackend> {
        &self.profiles
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Bring up the push channel (idempotent).
    pub fn connect(&self) {
        self.channel.connect();
    }

    /// Tear down the push channel, e.g. on logout.
    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Resolves once the channel reports a terminal authentication
    /// failure; `None` if the channel shut down without one.
    pub async fn wait_session_expired(&self) -> Option<SessionError> {
        let mut terminal = self.terminal.lock().await;
        terminal.recv().await.map(|error| match error {
            ChannelError::AuthRejected { .. } => SessionError::SessionExpired,
        })
    }

    /// List the session user's conversations via the directory service.
    pub async fn conversations(&self, page: u32) -> ServiceResult<DirectoryPage> {
        let result = self
            .backend
            .list_conversations(&self.local_user, page, DIRECTORY_PAGE_SIZE)
            .await?;
        for conversation in &result.conversations {
            if !conversation.roster_is_consistent() {
                warn!(conversation = %conversation.id, "Direct conversation with malformed roster");
            }
        }
        Ok(result)
    }

    /// Open a conversation view, replacing any previously open one.
    ///
    /// The initial history load is soft: on failure the view starts
    /// empty and the backstop poll converges it within one interval.
    pub async fn open_conversation(&self, conversation: &ConversationId) {
        self.close_conversation();

        let timeline = Arc::new(Mutex::new(Timeline::new(
            conversation.clone(),
            self.local_user.clone(),
        )));
        let fetch_seq = Arc::new(AtomicU64::new(0));

        match self
            .backend
            .fetch_messages(conversation, 0, self.config.page_size)
            .await
        {
            Ok(page) => {
                if let Ok(mut guard) = timeline.lock() {
                    guard.load_initial(page.messages);
                }
            }
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "Initial history load failed")
            }
        }

        // Live pushes for this conversation feed the timeline directly.
        let mut subscriptions = Vec::new();
        {
            let timeline = timeline.clone();
            let conversation = conversation.clone();
            subscriptions.push(
                self.channel
                    .subscribe(EventKind::MessageCreated, move |event| {
                        if let ServerEvent::MessageCreated {
                            conversation_id,
                            message,
                        } = event
                        {
                            if *conversation_id == conversation {
                                if let Ok(mut guard) = timeline.lock() {
                                    guard.apply_push(message.clone());
                                }
                            }
                        }
                    }),
            );
        }

        let mut tasks = Vec::new();

        // Backstop poll while the view is open.
        {
            let backend = self.backend.clone();
            let timeline = timeline.clone();
            let fetch_seq = fetch_seq.clone();
            let conversation = conversation.clone();
            let page_size = self.config.page_size;
            let interval = self.config.poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; the initial load
                // already covered it.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    refresh_once(&backend, &timeline, &fetch_seq, &conversation, page_size).await;
                }
            }));
        }

        // Catch up after every reconnect, closing any push gap.
        {
            let backend = self.backend.clone();
            let timeline = timeline.clone();
            let fetch_seq = fetch_seq.clone();
            let conversation = conversation.clone();
            let page_size = self.config.page_size;
            let mut state_rx = self.channel.watch_state();
            tasks.push(tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
                    if connected {
                        info!(conversation = %conversation, "Channel connected, catching up");
                        refresh_once(&backend, &timeline, &fetch_seq, &conversation, page_size)
                            .await;
                    }
                }
            }));
        }

        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveView {
                conversation: conversation.clone(),
                timeline,
                subscriptions,
                tasks,
                send_gate: Arc::new(AsyncMutex::new(())),
                fetch_seq,
            });
        }
        info!(conversation = %conversation, "Opened conversation");
    }

    /// Close the open view, if any: unsubscribe its handlers and stop
    /// its background tasks.
    pub fn close_conversation(&self) {
        let view = match self.active.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        if let Some(view) = view {
            for id in &view.subscriptions {
                self.channel.unsubscribe(*id);
            }
            for task in &view.tasks {
                task.abort();
            }
            // Invalidate any fetch still in flight for this view.
            view.fetch_seq.fetch_add(1, Ordering::SeqCst);
            debug!(conversation = %view.conversation, "Closed conversation view");
        }
    }

    /// Snapshot of the open conversation's sequence; empty if
    /// `conversation` is not the open one.
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        let Some((timeline, _)) = self.view_parts(conversation) else {
            return Vec::new();
        };
        let snapshot = match timeline.lock() {
            Ok(guard) => guard.messages(),
            Err(_) => Vec::new(),
        };
        snapshot
    }

    /// Send a message in the open conversation.
    ///
    /// Rejects blank content without a network call. At most one
    /// submission is in flight per conversation; concurrent sends queue
    /// in order. On failure the optimistic entry is rolled back and the
    /// trimmed content is returned inside the error so the caller can
    /// restore its input field.
    pub async fn send(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<Message, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (timeline, send_gate) = {
            let guard = self
                .active
                .lock()
                .map_err(|_| SessionError::NotOpen(conversation.clone()))?;
            match guard.as_ref() {
                Some(view) if view.conversation == *conversation => {
                    (view.timeline.clone(), view.send_gate.clone())
                }
                _ => return Err(SessionError::NotOpen(conversation.clone())),
            }
        };

        self.typing.local_stop_typing(conversation);

        let _turn = send_gate.lock().await;

        let handle = match timeline.lock() {
            Ok(mut guard) => guard.send_optimistic(content).0,
            Err(_) => return Err(SessionError::NotOpen(conversation.clone())),
        };

        match self.backend.submit_message(conversation, content).await {
            Ok(server_message) => {
                if let Ok(mut guard) = timeline.lock() {
                    guard.confirm(&handle, server_message.clone());
                }
                // Best-effort echo so sibling sessions converge sooner;
                // the submission service stays the source of truth.
                self.channel.send(ClientEvent::MessageCreated {
                    conversation_id: conversation.clone(),
                    message: server_message.clone(),
                });
                info!(conversation = %conversation, id = %server_message.id, "Message sent");
                Ok(server_message)
            }
            Err(e) => {
                if let Ok(mut guard) = timeline.lock() {
                    guard.rollback(&handle);
                }
                warn!(conversation = %conversation, error = %e, "Message submission failed");
                Err(SessionError::Submission {
                    content: content.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Merge the newest history page into the open view. Invoked by the
    /// backstop poll and on reconnect; safe to call any time.
    pub async fn ensure_fresh(&self, conversation: &ConversationId) {
        let Some((timeline, fetch_seq)) = self.view_parts(conversation) else {
            return;
        };
        refresh_once(
            &self.backend,
            &timeline,
            &fetch_seq,
            conversation,
            self.config.page_size,
        )
        .await;
    }

    fn view_parts(
        &self,
        conversation: &ConversationId,
    ) -> Option<(Arc<Mutex<Timeline>>, Arc<AtomicU64>)> {
        let guard = self.active.lock().ok()?;
        match guard.as_ref() {
            Some(view) if view.conversation == *conversation => {
                Some((view.timeline.clone(), view.fetch_seq.clone()))
            }
            _ => None,
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close_conversation();
        for id in &self.typing_subscriptions {
            self.channel.unsubscribe(*id);
        }
    }
}

/// One guarded history fetch: results are applied only if no newer fetch
/// (or a view teardown) superseded this one while it was in flight.
async fn refresh_once(
    backend: &Arc<dyn ChatBackend>,
    timeline: &Arc<Mutex<Timeline>>,
    fetch_seq: &Arc<AtomicU64>,
    conversation: &ConversationId,
    page_size: u32,
) {
    let seq = fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
    match backend.fetch_messages(conversation, 0, page_size).await {
        Ok(page) => {
            if fetch_seq.load(Ordering::SeqCst) != seq {
                debug!(conversation = %conversation, "Discarding superseded history fetch");
                return;
            }
            if let Ok(mut guard) = timeline.lock() {
                guard.merge_fetched(page.messages);
            }
        }
        Err(e) => {
            warn!(conversation = %conversation, error = %e, "History refresh failed")
        }
    }
}
