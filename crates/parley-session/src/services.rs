//! Contracts of the external collaborators.
//!
//! The conversation directory, message history, message submission, and
//! user directory are black boxes to this core; everything behind these
//! traits is replaceable, and tests substitute in-memory fakes.

use async_trait::async_trait;
use thiserror::Error;

use parley_shared::types::{Conversation, ConversationId, Message, UserId, UserProfile};

/// Errors produced by a collaborator endpoint.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The request never produced a response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("Unexpected status {status}")]
    Status { status: u16 },

    /// The response body did not match the contract.
    #[error("Malformed response: {0}")]
    Decode(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// One page of conversation listings.
#[derive(Debug, Clone)]
pub struct DirectoryPage {
    pub conversations: Vec<Conversation>,
    pub has_more: bool,
}

/// One page of persisted messages, ordered by creation time.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// List the conversations `user` participates in.
    async fn list_conversations(
        &self,
        user: &UserId,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<DirectoryPage>;
}

#[async_trait]
pub trait MessageHistory: Send + Sync {
    /// Fetch one page of persisted messages, newest page first.
    /// Idempotent read; safe to call repeatedly.
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<HistoryPage>;
}

#[async_trait]
pub trait MessageSubmission: Send + Sync {
    /// Persist a new message and return the canonical stored record with
    /// its server-assigned identifier and timestamp.
    async fn submit_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> ServiceResult<Message>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve display metadata for a user.
    async fn lookup_user(&self, user: &UserId) -> ServiceResult<UserProfile>;
}

/// The full set of collaborator endpoints a session needs.
pub trait ChatBackend:
    ConversationDirectory + MessageHistory + MessageSubmission + UserDirectory
{
}

impl<T> ChatBackend for T where
    T: ConversationDirectory + MessageHistory + MessageSubmission + UserDirectory
{
}
