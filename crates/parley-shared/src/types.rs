use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// Identifiers are opaque strings assigned by the backend services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier: server-assigned once persisted, client-generated
/// while a send is still in flight.
///
/// On the wire both arms render as a plain string; the `local:` prefix is
/// reserved for client-generated identifiers and never legitimately comes
/// back from a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Local(Uuid),
}

impl MessageId {
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.strip_prefix("local:") {
            Some(rest) => {
                let id = Uuid::parse_str(rest).map_err(serde::de::Error::custom)?;
                Ok(Self::Local(id))
            }
            None => Ok(Self::Server(raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Human-assigned name; groups only.
    pub name: Option<String>,
    pub participants: Vec<Participant>,
}

impl Conversation {
    /// A direct conversation carries exactly two participants.
    pub fn roster_is_consistent(&self) -> bool {
        match self.kind {
            ConversationKind::Direct => self.participants.len() == 2,
            ConversationKind::Group => true,
        }
    }

    /// Name to render for `viewer`: the assigned name if there is one,
    /// otherwise the other party (direct) or the joined roster (group).
    pub fn display_name(&self, viewer: &UserId) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let others: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| p.user_id != *viewer)
            .map(|p| p.display_name.as_str())
            .collect();
        others.join(", ")
    }
}

/// Message payload. Only plain text is in scope today.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text { content: String },
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Text { content } => content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub body: MessageBody,
    /// Creation time; the sole ordering key within a conversation.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message is still awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.id.is_local()
    }
}

/// Lifecycle of the push channel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Display metadata resolved through the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}
