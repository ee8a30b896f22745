//! Typing presence: debounced outbound signals and a decayed read view.
//!
//! Activity is a pure function of stored timestamps; nothing here owns a
//! timer, so a conversation view can close mid-TTL without leaking
//! anything. Expired entries are pruned lazily on read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parley_net::PushChannel;
use parley_shared::constants::{TYPING_DEBOUNCE_SECS, TYPING_TTL_SECS};
use parley_shared::protocol::ClientEvent;
use parley_shared::types::{ConversationId, UserId};

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// An entry is active while (now − last signal) < ttl. Covers the
    /// case where a stop signal is lost to a disconnect.
    pub ttl: Duration,
    /// Minimum gap between outbound `typing.start` signals per
    /// conversation.
    pub debounce: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(TYPING_TTL_SECS),
            debounce: Duration::from_secs(TYPING_DEBOUNCE_SECS),
        }
    }
}

/// Tracks who is currently typing in which conversation.
pub struct TypingTracker {
    config: TypingConfig,
    local_user: UserId,
    channel: Arc<PushChannel>,
    remote: Mutex<HashMap<(ConversationId, UserId), Instant>>,
    last_local: Mutex<HashMap<ConversationId, Instant>>,
}

impl TypingTracker {
    pub fn new(channel: Arc<PushChannel>, local_user: UserId, config: TypingConfig) -> Self {
        Self {
            config,
            local_user,
            channel,
            remote: Mutex::new(HashMap::new()),
            last_local: Mutex::new(HashMap::new()),
        }
    }

    /// Safe to call on every keystroke; emits at most one `typing.start`
    /// per debounce window per conversation.
    pub fn local_start_typing(&self, conversation: &ConversationId) {
        if !self.note_local_signal(conversation, Instant::now()) {
            return;
        }
        self.channel.send(ClientEvent::TypingStart {
            conversation_id: conversation.clone(),
            user_id: self.local_user.clone(),
        });
    }

    /// Called on message send, input blur, or the input emptying.
    pub fn local_stop_typing(&self, conversation: &ConversationId) {
        if let Ok(mut last) = self.last_local.lock() {
            last.remove(conversation);
        }
        self.channel.send(ClientEvent::TypingStop {
            conversation_id: conversation.clone(),
            user_id: self.local_user.clone(),
        });
    }

    /// A start for an already-active user refreshes its timestamp.
    pub fn on_remote_start(&self, conversation: &ConversationId, user: &UserId) {
        if let Ok(mut remote) = self.remote.lock() {
            remote.insert((conversation.clone(), user.clone()), Instant::now());
        }
    }

    /// A stop for a user with no active entry is a no-op.
    pub fn on_remote_stop(&self, conversation: &ConversationId, user: &UserId) {
        if let Ok(mut remote) = self.remote.lock() {
            remote.remove(&(conversation.clone(), user.clone()));
        }
    }

    /// Users whose last signal is younger than the TTL, in stable order.
    pub fn active_typers(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.active_typers_at(conversation, Instant::now())
    }

    fn active_typers_at(&self, conversation: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut remote = match self.remote.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        let ttl = self.config.ttl;
        remote.retain(|_, last| now.duration_since(*last) < ttl);

        let mut typers: Vec<UserId> = remote
            .iter()
            .filter(|((c, _), _)| c == conversation)
            .map(|((_, user), _)| user.clone())
            .collect();
        typers.sort();
        typers
    }

    /// Record a local signal; returns whether it should go on the wire.
    fn note_local_signal(&self, conversation: &ConversationId, now: Instant) -> bool {
        let mut last = match self.last_local.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if let Some(previous) = last.get(conversation) {
            if now.duration_since(*previous) < self.config.debounce {
                return false;
            }
        }
        last.insert(conversation.clone(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_net::{ChannelConfig, Connector, TransportStream};

    struct NoopConnector;

    impl Connector for NoopConnector {
        fn connect<'a>(
            &'a self,
            _url: &'a str,
        ) -> futures::future::BoxFuture<'a, anyhow::Result<TransportStream>> {
            Box::pin(async { Err(anyhow::anyhow!("no transport in tests")) })
        }
    }

    fn tracker(ttl_ms: u64, debounce_ms: u64) -> TypingTracker {
        let (channel, _terminal) = PushChannel::new(
            Arc::new(NoopConnector),
            ChannelConfig::new("ws://localhost:9/live", "token"),
        );
        TypingTracker::new(
            Arc::new(channel),
            UserId::new("me"),
            TypingConfig {
                ttl: Duration::from_millis(ttl_ms),
                debounce: Duration::from_millis(debounce_ms),
            },
        )
    }

    #[test]
    fn test_entry_expires_without_stop() {
        let tracker = tracker(5_000, 2_000);
        let conversation = ConversationId::new("c1");
        let alice = UserId::new("alice");

        let t0 = Instant::now();
        tracker.on_remote_start(&conversation, &alice);

        // Inside the window the user is active; past it, gone for good.
        assert_eq!(
            tracker.active_typers_at(&conversation, t0 + Duration::from_millis(2_500)),
            vec![alice.clone()]
        );
        assert!(tracker
            .active_typers_at(&conversation, t0 + Duration::from_millis(10_000))
            .is_empty());
        assert!(tracker
            .active_typers_at(&conversation, t0 + Duration::from_millis(2_500))
            .is_empty());
    }

    #[test]
    fn test_start_refreshes_existing_entry() {
        let tracker = tracker(5_000, 2_000);
        let conversation = ConversationId::new("c1");
        let alice = UserId::new("alice");

        tracker.on_remote_start(&conversation, &alice);
        tracker.on_remote_start(&conversation, &alice);
        let now = Instant::now();
        assert_eq!(tracker.active_typers_at(&conversation, now).len(), 1);
    }

    #[test]
    fn test_stop_removes_and_tolerates_unknown() {
        let tracker = tracker(5_000, 2_000);
        let conversation = ConversationId::new("c1");
        let alice = UserId::new("alice");

        tracker.on_remote_stop(&conversation, &alice);

        tracker.on_remote_start(&conversation, &alice);
        tracker.on_remote_stop(&conversation, &alice);
        assert!(tracker.active_typers(&conversation).is_empty());
    }

    #[test]
    fn test_conversations_are_isolated() {
        let tracker = tracker(5_000, 2_000);
        let c1 = ConversationId::new("c1");
        let c2 = ConversationId::new("c2");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        tracker.on_remote_start(&c1, &alice);
        tracker.on_remote_start(&c2, &bob);

        let now = Instant::now();
        assert_eq!(tracker.active_typers_at(&c1, now), vec![alice]);
        assert_eq!(tracker.active_typers_at(&c2, now), vec![bob]);
    }

    #[test]
    fn test_local_signal_is_debounced() {
        let tracker = tracker(5_000, 2_000);
        let conversation = ConversationId::new("c1");

        let t0 = Instant::now();
        assert!(tracker.note_local_signal(&conversation, t0));
        assert!(!tracker.note_local_signal(&conversation, t0 + Duration::from_millis(500)));
        assert!(!tracker.note_local_signal(&conversation, t0 + Duration::from_millis(1_900)));
        assert!(tracker.note_local_signal(&conversation, t0 + Duration::from_millis(2_100)));
    }

    #[test]
    fn test_stop_clears_debounce_window() {
        let tracker = tracker(5_000, 2_000);
        let conversation = ConversationId::new("c1");

        let t0 = Instant::now();
        assert!(tracker.note_local_signal(&conversation, t0));
        tracker.local_stop_typing(&conversation);
        assert!(tracker.note_local_signal(&conversation, t0 + Duration::from_millis(100)));
    }
}
