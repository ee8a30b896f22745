//! Ordered, deduplicated message sequence for the open conversation.
//!
//! Three sources feed the sequence: the initial history page, backstop
//! fetches, and live push events. Merges are idempotent by message
//! identifier, ordering is (timestamp, insertion order), and an
//! optimistic send is replaced in place when its confirmation arrives,
//! whether that confirmation comes back on the submission call or races
//! ahead of it as a push echo.

use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use parley_shared::types::{ConversationId, Message, MessageBody, MessageId, UserId};

/// Handle to an optimistic send, used to confirm or roll it back.
#[derive(Debug, Clone)]
pub struct PendingSend {
    local_id: Uuid,
}

impl PendingSend {
    pub fn local_id(&self) -> MessageId {
        MessageId::Local(self.local_id)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Monotonic insertion counter; ties on `sent_at` keep arrival order.
    seq: u64,
}

/// The authoritative in-memory sequence for one conversation.
///
/// All mutation must be serialized by the owner (the session wraps this
/// in a per-conversation mutex); different conversations share nothing.
#[derive(Debug)]
pub struct Timeline {
    conversation_id: ConversationId,
    local_user: UserId,
    entries: Vec<Entry>,
    ids: HashSet<MessageId>,
    next_seq: u64,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation_id,
            local_user,
            entries: Vec::new(),
            ids: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Replace the sequence wholesale with the initial history page.
    /// Every other operation is an incremental merge.
    pub fn load_initial(&mut self, messages: Vec<Message>) {
        self.entries.clear();
        self.ids.clear();
        for message in messages {
            self.insert(message);
        }
    }

    /// Merge a fetched page: known identifiers are ignored, missing ones
    /// are inserted at their sorted position. Pending local entries are
    /// never touched, even when the fetch does not know about them yet.
    pub fn merge_fetched(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.insert(message);
        }
    }

    /// Apply a live `message.created` push.
    ///
    /// A push authored by the local user may be the echo of an in-flight
    /// optimistic send arriving before the submission response; in that
    /// case the pending entry is replaced in place instead of a second
    /// entry being inserted.
    pub fn apply_push(&mut self, message: Message) {
        if self.ids.contains(&message.id) {
            debug!(id = %message.id, "Ignoring duplicate pushed message");
            return;
        }

        if message.sender == self.local_user {
            let pending = self
                .entries
                .iter()
                .position(|e| e.message.id.is_local() && e.message.body == message.body);
            if let Some(position) = pending {
                debug!(id = %message.id, "Push echo confirmed pending send");
                self.replace_at(position, message);
                return;
            }
        }

        self.insert(message);
    }

    /// Append an optimistic message with a temporary identifier; returns
    /// the handle used to later confirm or roll it back, plus the entry
    /// as rendered.
    pub fn send_optimistic(&mut self, content: impl Into<String>) -> (PendingSend, Message) {
        let local_id = Uuid::new_v4();
        let message = Message {
            id: MessageId::Local(local_id),
            conversation_id: self.conversation_id.clone(),
            sender: self.local_user.clone(),
            body: MessageBody::text(content),
            sent_at: Utc::now(),
        };
        self.insert(message.clone());
        (PendingSend { local_id }, message)
    }

    /// Replace the pending entry with the server-confirmed record, in
    /// place. A no-op if a push echo already replaced it.
    pub fn confirm(&mut self, handle: &PendingSend, server_message: Message) {
        let local = handle.local_id();
        if self.ids.contains(&server_message.id) && !self.ids.contains(&local) {
            debug!(id = %server_message.id, "Confirmation already applied via push");
            return;
        }
        match self.entries.iter().position(|e| e.message.id == local) {
            Some(position) => self.replace_at(position, server_message),
            None => {
                debug!(id = %server_message.id, "Confirm for unknown pending entry ignored")
            }
        }
    }

    /// Remove the pending entry after a failed submission.
    pub fn rollback(&mut self, handle: &PendingSend) {
        let local = handle.local_id();
        if let Some(position) = self.entries.iter().position(|e| e.message.id == local) {
            self.entries.remove(position);
            self.ids.remove(&local);
        }
    }

    /// Snapshot of the sequence, sorted ascending by effective timestamp.
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry still awaits confirmation.
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.message.id.is_local())
    }

    fn insert(&mut self, message: Message) {
        if self.ids.contains(&message.id) {
            return;
        }
        self.ids.insert(message.id.clone());
        let entry = Entry {
            message,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let key = (entry.message.sent_at, entry.seq);
        let position = self
            .entries
            .partition_point(|e| (e.message.sent_at, e.seq) <= key);
        self.entries.insert(position, entry);
    }

    /// Swap an entry's record for the confirmed one, keeping its slot in
    /// the tie-break order, then restore timestamp ordering. The sort is
    /// stable, so every other entry keeps its relative position.
    fn replace_at(&mut self, position: usize, server_message: Message) {
        let entry = &mut self.entries[position];
        self.ids.remove(&entry.message.id);
        self.ids.insert(server_message.id.clone());
        entry.message = server_message;
        self.entries.sort_by_key(|e| (e.message.sent_at, e.seq));
    }
}
