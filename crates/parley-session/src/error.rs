use thiserror::Error;

use parley_shared::types::ConversationId;

use crate::services::ServiceError;

/// Errors the session façade surfaces to callers.
///
/// Transport-level push failures never appear here; they are retried
/// behind the polling backstop.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A send was attempted with no content left after trimming.
    #[error("Message is empty")]
    EmptyMessage,

    /// The named conversation is not the open one.
    #[error("Conversation {0} is not open")]
    NotOpen(ConversationId),

    /// The submission service rejected or failed a send. The trimmed
    /// content is handed back so the caller can restore the input field
    /// and retry explicitly.
    #[error("Message submission failed: {source}")]
    Submission {
        content: String,
        #[source]
        source: ServiceError,
    },

    /// The push channel was refused at handshake; the session token
    /// needs renewal.
    #[error("Session needs renewal")]
    SessionExpired,

    /// Other collaborator failure.
    #[error(transparent)]
    Service(#[from] ServiceError),
}
