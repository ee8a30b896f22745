//! # parley-session
//!
//! Per-session messaging core: the external service contracts and their
//! REST implementation, the typing tracker, the message timeline that
//! reconciles push and poll delivery, and the [`ChatSession`] façade the
//! rest of the product talks to.

pub mod error;
pub mod http;
pub mod profiles;
pub mod services;
pub mod session;
pub mod timeline;
pub mod typing;

pub use error::SessionError;
pub use http::HttpServices;
pub use profiles::ProfileCache;
pub use services::{
    ChatBackend, ConversationDirectory, DirectoryPage, HistoryPage, MessageHistory,
    MessageSubmission, ServiceError, ServiceResult, UserDirectory,
};
pub use session::{ChatSession, SessionConfig, SyncConfig};
pub use timeline::{PendingSend, Timeline};
pub use typing::{TypingConfig, TypingTracker};
