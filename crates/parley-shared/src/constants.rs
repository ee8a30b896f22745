/// Typing entry time-to-live in seconds; an entry older than this is
/// inactive even if no explicit stop signal ever arrived.
pub const TYPING_TTL_SECS: u64 = 5;

/// Minimum gap between outbound `typing.start` signals per conversation.
pub const TYPING_DEBOUNCE_SECS: u64 = 2;

/// Reconnect backoff base delay in milliseconds.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Reconnect backoff cap in milliseconds.
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// The join handshake must complete within this many seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Backstop poll interval in seconds while a conversation is open.
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Page size for history fetches (initial load and refreshes).
pub const HISTORY_PAGE_SIZE: u32 = 50;

/// Page size for conversation directory listings.
pub const DIRECTORY_PAGE_SIZE: u32 = 25;

/// Depth of the outbound command queue feeding the push channel task.
pub const CHANNEL_COMMAND_BUFFER: usize = 256;
