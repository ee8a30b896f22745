use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, Message, UserId};

/// Events arriving on the push channel.
///
/// Frames are JSON objects tagged by `kind`. A kind this client does not
/// know fails deserialization and is dropped by the receiver, never
/// surfaced as an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum ServerEvent {
    /// Join handshake accepted; the channel is live.
    #[serde(rename = "join.ack")]
    JoinAck,

    /// Join handshake refused; the session token is no longer valid.
    #[serde(rename = "join.rejected")]
    JoinRejected { reason: String },

    /// A message was persisted in a conversation.
    #[serde(rename = "message.created")]
    MessageCreated {
        conversation_id: ConversationId,
        message: Message,
    },

    /// A participant started typing.
    #[serde(rename = "typing.start")]
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// A participant stopped typing.
    #[serde(rename = "typing.stop")]
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

/// Events this client pushes onto the channel.
///
/// Everything except `join` is best-effort echo; delivery is never
/// assumed and correctness never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum ClientEvent {
    /// Authenticate the channel against the current session.
    #[serde(rename = "join")]
    Join { token: String },

    #[serde(rename = "message.created")]
    MessageCreated {
        conversation_id: ConversationId,
        message: Message,
    },

    #[serde(rename = "typing.start")]
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[serde(rename = "typing.stop")]
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

/// Inbound event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageCreated,
    TypingStart,
    TypingStop,
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Subscription kind for routable events; handshake frames have none.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::MessageCreated { .. } => Some(EventKind::MessageCreated),
            Self::TypingStart { .. } => Some(EventKind::TypingStart),
            Self::TypingStop { .. } => Some(EventKind::TypingStop),
            Self::JoinAck | Self::JoinRejected { .. } => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::MessageCreated {
                conversation_id, ..
            }
            | Self::TypingStart {
                conversation_id, ..
            }
            | Self::TypingStop {
                conversation_id, ..
            } => Some(conversation_id),
            Self::JoinAck | Self::JoinRejected { .. } => None,
        }
    }
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
