//! Push channel lifecycle: connect, authenticate, dispatch, reconnect.
//!
//! The connection runs in a dedicated tokio task. External code feeds it
//! through a command channel and observes it through a connection-state
//! watch plus per-kind subscriptions, keeping the transport fully
//! decoupled from the session logic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use parley_shared::constants::{CHANNEL_COMMAND_BUFFER, HANDSHAKE_TIMEOUT_SECS};
use parley_shared::protocol::{ClientEvent, EventKind, ServerEvent};
use parley_shared::types::ConnectionState;

use crate::backoff::{Backoff, BackoffConfig};
use crate::transport::{Connector, TransportStream};

/// Terminal channel failures. Transport drops are retried internally and
/// never show up here.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The join handshake was refused; the session token needs renewal
    /// before another connect attempt can succeed.
    #[error("Channel authentication rejected: {reason}")]
    AuthRejected { reason: String },
}

/// Commands sent *into* the connection task.
#[derive(Debug)]
enum ChannelCommand {
    /// Push an outbound event, best-effort.
    Send(ClientEvent),
    /// Tear the connection down and stop reconnecting.
    Shutdown,
}

type Handler = Box<dyn Fn(&ServerEvent) + Send + Sync>;

/// Token returned by [`PushChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscriptions {
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

impl Subscriptions {
    /// Invoke handlers for the event's kind in registration order.
    fn dispatch(&self, event: &ServerEvent) {
        let Some(kind) = event.kind() else {
            debug!(event = ?event, "Ignoring non-routable frame outside handshake");
            return;
        };
        if let Some(handlers) = self.by_kind.get(&kind) {
            for (_, handler) in handlers {
                handler(event);
            }
        }
    }
}

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the live channel.
    pub url: String,
    /// Session token presented during the join handshake.
    pub auth_token: String,
    /// How long the join handshake may take before the attempt fails.
    pub handshake_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            backoff: BackoffConfig::default(),
        }
    }
}

struct Running {
    cmd_tx: mpsc::Sender<ChannelCommand>,
    handle: JoinHandle<()>,
}

/// One logical push channel bound to an authenticated session.
///
/// The channel is session-scoped and explicitly owned: callers construct
/// one per authenticated session and inject it wherever live events are
/// needed. There is no process-global instance.
pub struct PushChannel {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    running: Mutex<Option<Running>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    terminal_tx: mpsc::Sender<ChannelError>,
    next_subscription: AtomicU64,
}

impl PushChannel {
    /// Create a channel.
    ///
    /// The returned receiver yields terminal errors (authentication
    /// rejection); everything else is retried internally with backoff.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
    ) -> (Self, mpsc::Receiver<ChannelError>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (terminal_tx, terminal_rx) = mpsc::channel(4);

        let channel = Self {
            config,
            connector,
            running: Mutex::new(None),
            state_tx,
            state_rx,
            subscriptions: Arc::new(Mutex::new(Subscriptions::default())),
            terminal_tx,
            next_subscription: AtomicU64::new(1),
        };
        (channel, terminal_rx)
    }

    /// Start the connection task. No-op while one is already running.
    pub fn connect(&self) {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("connect() ignored: channel task already running");
                return;
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_COMMAND_BUFFER);
        let handle = tokio::spawn(run(
            self.connector.clone(),
            self.config.clone(),
            self.subscriptions.clone(),
            self.state_tx.clone(),
            self.terminal_tx.clone(),
            cmd_rx,
        ));
        *running = Some(Running { cmd_tx, handle });
    }

    /// Tear the connection down and cancel any scheduled reconnect.
    pub fn disconnect(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        if let Some(running) = running {
            if running.cmd_tx.try_send(ChannelCommand::Shutdown).is_err() {
                running.handle.abort();
            }
            let _ = self.state_tx.send(ConnectionState::Disconnected);
            info!("Push channel disconnected");
        }
    }

    /// Fire-and-forget push of an outbound event.
    ///
    /// Dropped with a debug log when the channel is not connected;
    /// callers must not rely on delivery.
    pub fn send(&self, event: ClientEvent) {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            debug!("Dropping outbound event: channel not connected");
            return;
        }
        let running = match self.running.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(running) = running.as_ref() {
            if let Err(e) = running.cmd_tx.try_send(ChannelCommand::Send(event)) {
                debug!(error = %e, "Dropping outbound event: command queue unavailable");
            }
        }
    }

    /// Register a handler for one inbound event kind.
    ///
    /// Handlers for a kind run synchronously in registration order on the
    /// connection task; they must not block.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions
                .by_kind
                .entry(kind)
                .or_default()
                .push((id, Box::new(handler)));
        }
        id
    }

    /// Remove a handler; required when a conversation view closes so no
    /// handler fires against torn-down state.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for handlers in subscriptions.by_kind.values_mut() {
                handlers.retain(|(handler_id, _)| *handler_id != id);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection-state transitions (e.g. to catch up after a
    /// reconnect).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

enum EstablishError {
    AuthRejected { reason: String },
    Transport(anyhow::Error),
}

/// Dial the endpoint and complete the join handshake.
async fn establish(
    connector: &dyn Connector,
    config: &ChannelConfig,
) -> Result<TransportStream, EstablishError> {
    let mut transport = connector
        .connect(&config.url)
        .await
        .map_err(EstablishError::Transport)?;

    let join = ClientEvent::Join {
        token: config.auth_token.clone(),
    }
    .to_json()
    .map_err(|e| EstablishError::Transport(e.into()))?;
    transport
        .tx
        .send(join)
        .await
        .map_err(EstablishError::Transport)?;

    let first = timeout(config.handshake_timeout, transport.rx.next())
        .await
        .map_err(|_| EstablishError::Transport(anyhow::anyhow!("handshake timed out")))?;

    match first {
        Some(Ok(frame)) => match ServerEvent::from_json(&frame) {
            Ok(ServerEvent::JoinAck) => Ok(transport),
            Ok(ServerEvent::JoinRejected { reason }) => Err(EstablishError::AuthRejected { reason }),
            Ok(other) => Err(EstablishError::Transport(anyhow::anyhow!(
                "unexpected handshake reply: {other:?}"
            ))),
            Err(e) => Err(EstablishError::Transport(e.into())),
        },
        Some(Err(e)) => Err(EstablishError::Transport(e)),
        None => Err(EstablishError::Transport(anyhow::anyhow!(
            "transport closed during handshake"
        ))),
    }
}

enum ServeOutcome {
    Shutdown,
    TransportLost,
}

/// Pump one established connection until it drops or is shut down.
async fn serve(
    mut transport: TransportStream,
    subscriptions: &Mutex<Subscriptions>,
    cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
) -> ServeOutcome {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Send(event)) => match event.to_json() {
                    Ok(frame) => {
                        if let Err(e) = transport.tx.send(frame).await {
                            warn!(error = %e, "Outbound send failed, dropping connection");
                            return ServeOutcome::TransportLost;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode outbound event"),
                },
                Some(ChannelCommand::Shutdown) | None => return ServeOutcome::Shutdown,
            },

            inbound = transport.rx.next() => match inbound {
                Some(Ok(frame)) => dispatch_frame(subscriptions, &frame),
                Some(Err(e)) => {
                    warn!(error = %e, "Push channel read error");
                    return ServeOutcome::TransportLost;
                }
                None => {
                    debug!("Push channel closed by remote");
                    return ServeOutcome::TransportLost;
                }
            },
        }
    }
}

/// Parse one inbound frame and hand it to subscribers. Malformed frames
/// are dropped with a diagnostic; they never reach the merge pipeline.
fn dispatch_frame(subscriptions: &Mutex<Subscriptions>, frame: &str) {
    let event = match ServerEvent::from_json(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, len = frame.len(), "Ignoring unparseable inbound frame");
            return;
        }
    };
    let guard = match subscriptions.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    guard.dispatch(&event);
}

/// Connection task: connect, serve, reconnect with capped backoff.
///
/// Exactly one reconnect sleep is outstanding at any time; an explicit
/// shutdown cancels it.
async fn run(
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    subscriptions: Arc<Mutex<Subscriptions>>,
    state_tx: watch::Sender<ConnectionState>,
    terminal_tx: mpsc::Sender<ChannelError>,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
) {
    let mut backoff = Backoff::new(config.backoff.clone());

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        debug!(url = %config.url, attempt = backoff.attempt(), "Connecting push channel");

        match establish(&*connector, &config).await {
            Ok(transport) => {
                backoff.reset();
                let _ = state_tx.send(ConnectionState::Connected);
                info!("Push channel connected");

                match serve(transport, &subscriptions, &mut cmd_rx).await {
                    ServeOutcome::Shutdown => break,
                    ServeOutcome::TransportLost => {
                        warn!("Push channel transport lost, scheduling reconnect");
                    }
                }
            }
            Err(EstablishError::AuthRejected { reason }) => {
                warn!(reason = %reason, "Push channel authentication rejected");
                let _ = state_tx.send(ConnectionState::Disconnected);
                let _ = terminal_tx.send(ChannelError::AuthRejected { reason }).await;
                break;
            }
            Err(EstablishError::Transport(e)) => {
                debug!(error = %e, "Push channel connect attempt failed");
            }
        }

        let _ = state_tx.send(ConnectionState::Disconnected);

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Shutdown) | None => break,
                Some(ChannelCommand::Send(_)) => {
                    debug!("Dropping outbound event queued while disconnected");
                }
            }
        }
    }

    let _ = state_tx.send(ConnectionState::Disconnected);
    info!("Push channel task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameSink, FrameStream};
    use chrono::Utc;
    use futures::channel::mpsc as futures_mpsc;
    use parley_shared::types::{ConversationId, Message, MessageBody, MessageId, UserId};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// One accepted dial, driven by the test body.
    struct ServerEnd {
        to_client: futures_mpsc::UnboundedSender<String>,
        from_client: futures_mpsc::UnboundedReceiver<String>,
    }

    impl ServerEnd {
        async fn expect_join(&mut self) {
            let frame = self.from_client.next().await.expect("join frame");
            let event = ClientEvent::from_json(&frame).expect("valid join");
            assert!(matches!(event, ClientEvent::Join { .. }));
        }

        fn push(&self, event: &ServerEvent) {
            self.to_client
                .unbounded_send(event.to_json().unwrap())
                .unwrap();
        }

        fn push_raw(&self, frame: &str) {
            self.to_client.unbounded_send(frame.to_string()).unwrap();
        }
    }

    /// Connector handing each dial to the test through a queue.
    struct TestConnector {
        dials: UnboundedSender<ServerEnd>,
        /// Dials that should fail at the transport level before any
        /// handshake, consumed front to back.
        failures: StdMutex<VecDeque<()>>,
    }

    impl TestConnector {
        fn new() -> (Arc<Self>, UnboundedReceiver<ServerEnd>) {
            let (dials, accepted) = unbounded_channel();
            (
                Arc::new(Self {
                    dials,
                    failures: StdMutex::new(VecDeque::new()),
                }),
                accepted,
            )
        }

        fn fail_next_dial(&self) {
            self.failures.lock().unwrap().push_back(());
        }
    }

    impl Connector for TestConnector {
        fn connect<'a>(
            &'a self,
            _url: &'a str,
        ) -> futures::future::BoxFuture<'a, anyhow::Result<TransportStream>> {
            Box::pin(async move {
                if self.failures.lock().unwrap().pop_front().is_some() {
                    anyhow::bail!("dial refused by test connector");
                }

                let (client_tx, server_rx) = futures_mpsc::unbounded::<String>();
                let (server_tx, client_rx) = futures_mpsc::unbounded::<String>();

                self.dials
                    .send(ServerEnd {
                        to_client: server_tx,
                        from_client: server_rx,
                    })
                    .ok();

                let tx: FrameSink = Box::pin(client_tx.sink_map_err(anyhow::Error::from));
                let rx: FrameStream = Box::pin(client_rx.map(Ok));
                Ok(TransportStream { tx, rx })
            })
        }
    }

    fn test_config() -> ChannelConfig {
        let mut config = ChannelConfig::new("ws://localhost:9/live", "token-1");
        config.handshake_timeout = Duration::from_millis(500);
        config.backoff = BackoffConfig {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            jitter: false,
        };
        config
    }

    fn message_event(id: &str) -> ServerEvent {
        ServerEvent::MessageCreated {
            conversation_id: ConversationId::new("c1"),
            message: Message {
                id: MessageId::Server(id.into()),
                conversation_id: ConversationId::new("c1"),
                sender: UserId::new("alice"),
                body: MessageBody::text("salut"),
                sent_at: Utc::now(),
            },
        }
    }

    async fn wait_for_state(channel: &PushChannel, target: ConnectionState) {
        let mut rx = channel.watch_state();
        timeout(Duration::from_secs(1), rx.wait_for(|state| *state == target))
            .await
            .expect("state transition timed out")
            .expect("state watch closed");
    }

    #[tokio::test]
    async fn test_connects_after_handshake_and_dispatches() {
        let (connector, mut dials) = TestConnector::new();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        let (seen_tx, mut seen_rx) = unbounded_channel::<String>();
        channel.subscribe(EventKind::MessageCreated, move |event| {
            if let ServerEvent::MessageCreated { message, .. } = event {
                seen_tx.send(message.id.to_string()).ok();
            }
        });

        channel.connect();
        let mut server = dials.recv().await.unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;

        server.push(&message_event("m1"));
        let seen = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "m1");

        // Malformed and unknown frames are dropped without breaking the pipe.
        server.push_raw("{not json");
        server.push_raw(r#"{"kind":"presence.join"}"#);
        server.push(&message_event("m2"));
        let seen = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "m2");
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_drop() {
        let (connector, mut dials) = TestConnector::new();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        channel.connect();
        let mut server = dials.recv().await.unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;

        drop(server);
        wait_for_state(&channel, ConnectionState::Disconnected).await;

        let mut server = timeout(Duration::from_secs(1), dials.recv())
            .await
            .expect("no reconnect dial")
            .unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_dial_failures_backoff_then_recover() {
        let (connector, mut dials) = TestConnector::new();
        connector.fail_next_dial();
        connector.fail_next_dial();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        channel.connect();
        let mut server = timeout(Duration::from_secs(1), dials.recv())
            .await
            .expect("no dial after failures")
            .unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_auth_rejection_is_terminal() {
        let (connector, mut dials) = TestConnector::new();
        let (channel, mut terminal) = PushChannel::new(connector, test_config());

        channel.connect();
        let mut server = dials.recv().await.unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinRejected {
            reason: "token expired".into(),
        });

        let error = timeout(Duration::from_secs(1), terminal.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, ChannelError::AuthRejected { .. }));
        wait_for_state(&channel, ConnectionState::Disconnected).await;

        // No retry: the dial queue stays empty.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_soft_noop() {
        let (connector, _dials) = TestConnector::new();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        channel.send(ClientEvent::TypingStart {
            conversation_id: ConversationId::new("c1"),
            user_id: UserId::new("alice"),
        });
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (connector, mut dials) = TestConnector::new();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        let (order_tx, mut order_rx) = unbounded_channel::<u8>();
        let tx = order_tx.clone();
        let first = channel.subscribe(EventKind::MessageCreated, move |_| {
            tx.send(1).ok();
        });
        let tx = order_tx.clone();
        channel.subscribe(EventKind::MessageCreated, move |_| {
            tx.send(2).ok();
        });

        channel.connect();
        let mut server = dials.recv().await.unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;

        server.push(&message_event("m1"));
        assert_eq!(order_rx.recv().await, Some(1));
        assert_eq!(order_rx.recv().await, Some(2));

        channel.unsubscribe(first);
        server.push(&message_event("m2"));
        assert_eq!(order_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_outbound_send_reaches_server() {
        let (connector, mut dials) = TestConnector::new();
        let (channel, _terminal) = PushChannel::new(connector, test_config());

        channel.connect();
        let mut server = dials.recv().await.unwrap();
        server.expect_join().await;
        server.push(&ServerEvent::JoinAck);
        wait_for_state(&channel, ConnectionState::Connected).await;

        channel.send(ClientEvent::TypingStart {
            conversation_id: ConversationId::new("c1"),
            user_id: UserId::new("alice"),
        });

        let frame = timeout(Duration::from_secs(1), server.from_client.next())
            .await
            .unwrap()
            .unwrap();
        let event = ClientEvent::from_json(&frame).unwrap();
        assert!(matches!(event, ClientEvent::TypingStart { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect() {
        let (connector, mut dials) = TestConnector::new();
        connector.fail_next_dial();
        let (channel, _terminal) = PushChannel::new(connector.clone(), test_config());

        channel.connect();
        // Let the failed dial happen, then shut down during backoff.
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.disconnect();
        wait_for_state(&channel, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        while dials.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dials.try_recv().is_err());
    }
}
