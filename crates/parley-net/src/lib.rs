// Live push channel: WebSocket transport, reconnect backoff, and the
// connection task that dispatches inbound events to subscribers.

pub mod backoff;
pub mod channel;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelConfig, ChannelError, PushChannel, SubscriptionId};
pub use transport::{Connector, FrameSink, FrameStream, TransportStream, WebSocketConnector};
