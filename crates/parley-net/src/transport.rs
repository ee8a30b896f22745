//! Transport abstraction for the push channel.
//!
//! The connection task only ever sees framed text; production dials a
//! WebSocket, tests hand in an in-memory pair.

use std::pin::Pin;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

/// Outbound frames. Errors are fatal for the connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;

/// Inbound frames. The stream ending means the transport closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// A connected transport: paired outbound sink and inbound stream.
pub struct TransportStream {
    pub tx: FrameSink,
    pub rx: FrameStream,
}

/// Dials the live channel endpoint.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<TransportStream>>;
}

/// WebSocket connector used in production.
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<TransportStream>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(url)
                .await
                .context("WebSocket connect failed")?;
            let (write, read) = ws.split();

            let tx = write
                .with(|frame: String| async move {
                    Ok::<Message, tungstenite::Error>(Message::Text(frame.into()))
                })
                .sink_map_err(anyhow::Error::from);

            let rx = read.filter_map(|item| async move {
                match item {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "WebSocket close frame received");
                        None
                    }
                    // Ping/pong are handled by the protocol layer; binary
                    // frames are not part of the event protocol.
                    Ok(other) => {
                        debug!(len = other.len(), "Skipping non-text frame");
                        None
                    }
                    Err(e) => Some(Err(anyhow::Error::from(e))),
                }
            });

            Ok(TransportStream {
                tx: Box::pin(tx),
                rx: Box::pin(rx),
            })
        })
    }
}
