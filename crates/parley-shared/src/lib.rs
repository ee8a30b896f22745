//! # parley-shared
//!
//! Domain types and wire protocol for the Parley messaging core: opaque
//! identifiers, conversations and messages, the push-channel event enums,
//! and the default tuning constants used across the workspace.

pub mod constants;
pub mod protocol;
pub mod types;

pub use protocol::{ClientEvent, EventKind, ServerEvent};
pub use types::{
    ConnectionState, Conversation, ConversationId, ConversationKind, Message, MessageBody,
    MessageId, Participant, UserId, UserProfile,
};
