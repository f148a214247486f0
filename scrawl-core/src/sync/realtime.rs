//! Persistent realtime channel to the remote store.
//!
//! Maintains a long-lived WebSocket connection for out-of-band change
//! notifications and local mutation intents. The channel heartbeats to
//! detect half-open connections and reconnects with capped exponential
//! backoff, up to a bounded number of attempts. Notifications received here
//! are hints: consumers must re-check authoritative state via the transport,
//! never treat an event as the state itself.

use std::collections::HashSet;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::error::SyncError;
use super::protocol::{ChannelPayload, Envelope};
use crate::config::SyncConfig;
use crate::models::Document;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Ceiling for the exponential reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
        }
    }
}

/// Events emitted by the channel.
///
/// Delivery ordering across reconnects is not guaranteed.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// A document changed remotely.
    DocumentUpdated(Document),
    /// A document was deleted remotely.
    DocumentDeleted { document_id: String },
    /// The server flagged a conflict for a document.
    ConflictDetected {
        document_id: String,
        remote: Document,
    },
    /// Reconnect attempts are exhausted; manual intervention required.
    GaveUp,
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish(Document),
    Shutdown,
}

enum SessionEnd {
    Reconnect,
    Shutdown,
}

/// Handle to the realtime channel task.
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl RealtimeChannel {
    /// Spawns the channel task connecting to `server_url`.
    ///
    /// Returns the handle plus the event stream. Dropping the receiver does
    /// not stop the channel; call [`RealtimeChannel::shutdown`].
    pub fn connect(
        server_url: &str,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let runner = Runner {
            url: build_ws_url(server_url),
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: config.heartbeat_interval(),
            state: state_tx,
            events: events_tx,
            commands: commands_rx,
            subscriptions: HashSet::new(),
        };
        let task = tokio::spawn(runner.run());

        (
            Self {
                commands: commands_tx,
                state: state_rx,
                task,
            },
            events_rx,
        )
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// A watch receiver for observing state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Starts receiving notifications for a document. Subscriptions are
    /// replayed after every reconnect.
    pub fn subscribe(&self, document_id: &str) -> Result<(), SyncError> {
        self.send(Command::Subscribe(document_id.to_string()))
    }

    /// Stops receiving notifications for a document.
    pub fn unsubscribe(&self, document_id: &str) -> Result<(), SyncError> {
        self.send(Command::Unsubscribe(document_id.to_string()))
    }

    /// Announces a local mutation intent. Dropped silently if disconnected.
    pub fn publish_change(&self, document: Document) -> Result<(), SyncError> {
        self.send(Command::Publish(document))
    }

    /// Requests a clean shutdown; the task sends a close frame and exits
    /// without reconnecting.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::Channel("realtime channel task has stopped".into()))
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Runner {
    url: String,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    heartbeat_interval: Duration,
    state: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    subscriptions: HashSet<String>,
}

impl Runner {
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            let _ = self.state.send(ChannelState::Connecting);
            let ws = match connect_async(&self.url).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    warn!(url = %self.url, error = %e, "realtime connect failed");
                    let _ = self.state.send(ChannelState::Disconnected);
                    attempts += 1;
                    if self.give_up_or_wait(attempts).await {
                        return;
                    }
                    continue;
                }
            };

            attempts = 0;
            let _ = self.state.send(ChannelState::Connected);
            let _ = self.events.send(ChannelEvent::Connected);
            debug!(url = %self.url, "realtime channel connected");

            let (mut sink, stream) = ws.split();
            if self.replay_subscriptions(&mut sink).await.is_err() {
                // Connection died during replay; go straight to reconnect.
                let _ = self.state.send(ChannelState::Disconnected);
                let _ = self.events.send(ChannelEvent::Disconnected);
                attempts += 1;
                if self.give_up_or_wait(attempts).await {
                    return;
                }
                continue;
            }

            let end = self.session(&mut sink, stream).await;
            let _ = self.state.send(ChannelState::Disconnected);
            let _ = self.events.send(ChannelEvent::Disconnected);

            match end {
                SessionEnd::Shutdown => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                SessionEnd::Reconnect => {
                    attempts += 1;
                    if self.give_up_or_wait(attempts).await {
                        return;
                    }
                }
            }
        }
    }

    /// One connected session. Returns how it ended.
    async fn session(&mut self, sink: &mut WsSink, mut stream: WsStream) -> SessionEnd {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // Consume the immediate first tick so the first ping goes out one
        // full interval after connecting.
        heartbeat.tick().await;
        let mut pong_pending = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if pong_pending {
                        // No pong since our last ping: half-open connection.
                        warn!("heartbeat missed, reconnecting");
                        return SessionEnd::Reconnect;
                    }
                    if send_payload(sink, ChannelPayload::Ping).await.is_err() {
                        return SessionEnd::Reconnect;
                    }
                    pong_pending = true;
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return SessionEnd::Shutdown,
                    Some(Command::Subscribe(id)) => {
                        self.subscriptions.insert(id.clone());
                        if send_payload(sink, ChannelPayload::Subscribe { document_id: id })
                            .await
                            .is_err()
                        {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Command::Unsubscribe(id)) => {
                        self.subscriptions.remove(&id);
                        if send_payload(sink, ChannelPayload::Unsubscribe { document_id: id })
                            .await
                            .is_err()
                        {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Command::Publish(document)) => {
                        if send_payload(sink, ChannelPayload::DocumentChange { document })
                            .await
                            .is_err()
                        {
                            return SessionEnd::Reconnect;
                        }
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_frame(sink, &text, &mut pong_pending).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_pending = false;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("realtime connection closed by server");
                        return SessionEnd::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "realtime read error");
                        return SessionEnd::Reconnect;
                    }
                },
            }
        }
    }

    /// Handles one inbound text frame. `Err` means the sink failed.
    async fn handle_frame(
        &self,
        sink: &mut WsSink,
        text: &str,
        pong_pending: &mut bool,
    ) -> Result<(), ()> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "ignoring malformed realtime frame");
                return Ok(());
            }
        };
        match envelope.payload {
            ChannelPayload::Pong => {
                *pong_pending = false;
            }
            ChannelPayload::Ping => {
                send_payload(sink, ChannelPayload::Pong).await?;
            }
            ChannelPayload::DocumentUpdated { document } => {
                let _ = self.events.send(ChannelEvent::DocumentUpdated(document));
            }
            ChannelPayload::DocumentDeleted { document_id } => {
                let _ = self
                    .events
                    .send(ChannelEvent::DocumentDeleted { document_id });
            }
            ChannelPayload::ConflictDetected {
                document_id,
                remote,
            } => {
                let _ = self.events.send(ChannelEvent::ConflictDetected {
                    document_id,
                    remote,
                });
            }
            // Outbound-only payloads echoed back are ignored.
            _ => {}
        }
        Ok(())
    }

    async fn replay_subscriptions(&mut self, sink: &mut WsSink) -> Result<(), ()> {
        for id in self.subscriptions.clone() {
            send_payload(sink, ChannelPayload::Subscribe { document_id: id }).await?;
        }
        Ok(())
    }

    /// After a failed attempt: either gives up (returns `true`) or waits out
    /// the backoff delay, still servicing subscription commands so they are
    /// not lost while disconnected.
    async fn give_up_or_wait(&mut self, attempts: u32) -> bool {
        if attempts >= self.max_reconnect_attempts {
            warn!(attempts, "reconnect attempts exhausted, giving up");
            let _ = self.events.send(ChannelEvent::GaveUp);
            return true;
        }

        let delay = jittered(backoff_delay(self.reconnect_interval, attempts));
        debug!(attempts, ?delay, "waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Subscribe(id)) => {
                        self.subscriptions.insert(id);
                    }
                    Some(Command::Unsubscribe(id)) => {
                        self.subscriptions.remove(&id);
                    }
                    // Change intents are best-effort; dropped while offline.
                    Some(Command::Publish(_)) => {}
                },
            }
        }
    }
}

async fn send_payload(sink: &mut WsSink, payload: ChannelPayload) -> Result<(), ()> {
    let text = Envelope::new(payload).encode().map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|e| {
        warn!(error = %e, "realtime send failed");
    })
}

/// Exponential backoff for the given attempt number (1-based), capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Adds up to 25% random jitter so reconnecting clients do not stampede.
fn jittered(delay: Duration) -> Duration {
    let quarter = (delay.as_millis() / 4) as u64;
    if quarter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=quarter))
}

/// Builds the realtime endpoint URL, converting http(s) to ws(s).
fn build_ws_url(server_url: &str) -> String {
    let base = if server_url.starts_with("http://") {
        server_url.replace("http://", "ws://")
    } else if server_url.starts_with("https://") {
        server_url.replace("https://", "wss://")
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{}", server_url)
    } else {
        server_url.to_string()
    };
    format!("{}/realtime", base.trim_end_matches('/'))
}
