//! Per-connection session: the inbound pump and the outbound writer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_core::{ConnectionId, Submission};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::registry::{Connection, ConnectionRegistry};

/// Lifecycle of one client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Removes the connection from the registry when dropped, so removal runs on
/// every exit path out of the pump, unwinding included.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self.registry.remove(&self.id);
    }
}

/// Reads inbound units for one connection and hands each well-formed
/// submission to the broadcaster.
pub struct SessionPump {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    state: SessionState,
}

impl SessionPump {
    pub fn new(connection: Arc<Connection>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            registry: Arc::clone(broadcaster.registry()),
            connection,
            broadcaster,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!(connection_id = %self.connection.id, from = %self.state, to = %next, "session transition");
        self.state = next;
    }

    /// Register the connection, then pump inbound frames until the client
    /// disconnects, the channel errors, or the connection is closed from
    /// elsewhere. Returns the final state.
    pub async fn run<S, E>(mut self, mut inbound: S) -> SessionState
    where
        S: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: fmt::Display,
    {
        self.registry.add(Arc::clone(&self.connection));
        let registration = Registration {
            registry: Arc::clone(&self.registry),
            id: self.connection.id.clone(),
        };
        self.transition(SessionState::Open);
        info!(
            connection_id = %self.connection.id,
            author = %self.connection.identity(),
            "session open"
        );

        let reason = loop {
            tokio::select! {
                _ = self.connection.closed() => break "closed by server",
                frame = inbound.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.connection.touch();
                        self.handle_text(text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        self.connection.touch();
                        warn!(
                            connection_id = %self.connection.id,
                            len = bytes.len(),
                            "malformed input: binary frame, ignoring"
                        );
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => self.connection.touch(),
                    Some(Ok(WsMessage::Close(_))) | None => break "client disconnected",
                    Some(Err(e)) => {
                        warn!(connection_id = %self.connection.id, error = %e, "channel error");
                        break "channel error";
                    }
                }
            }
        };

        self.transition(SessionState::Closing);
        drop(registration);
        self.transition(SessionState::Closed);
        info!(connection_id = %self.connection.id, reason, "session closed");
        self.state
    }

    /// Parse one text frame and publish it. The SQLite append runs on the
    /// blocking pool; the pump waits for it before reading the next frame so
    /// this connection's submissions keep their order.
    async fn handle_text(&self, raw: &str) {
        let identity = self.connection.identity().clone();
        let submission = match Submission::parse(raw) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(connection_id = %self.connection.id, error = %e, "malformed input, ignoring");
                return;
            }
        };

        if submission.claims_other_author(&identity) {
            debug!(
                connection_id = %self.connection.id,
                claimed = submission.author.as_deref().unwrap_or_default(),
                author = %identity,
                "ignoring client-supplied author"
            );
        }

        let broadcaster = Arc::clone(&self.broadcaster);
        let body = submission.body;
        let published =
            tokio::task::spawn_blocking(move || broadcaster.publish(&identity, &body)).await;

        match published {
            Ok(Ok(message)) => {
                trace!(connection_id = %self.connection.id, message_id = message.id, "published");
            }
            Ok(Err(e)) => {
                error!(connection_id = %self.connection.id, error = %e, "publish failed");
                self.connection.send_error(&e);
            }
            Err(e) => {
                error!(connection_id = %self.connection.id, error = %e, "publish task failed");
            }
        }
    }
}

/// Timing knobs for the outbound writer.
#[derive(Clone, Copy, Debug)]
pub struct WriterConfig {
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&ServerConfig> for WriterConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// Drain the connection's outbox into the socket, pinging on an interval.
///
/// A write that fails or exceeds `send_timeout`, a heartbeat timeout, or a
/// closed connection ends the writer and closes the connection.
pub async fn write_outbound<W>(
    mut sink: W,
    mut outbox: mpsc::Receiver<Arc<String>>,
    connection: Arc<Connection>,
    config: WriterConfig,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = connection.closed() => break,
            payload = outbox.recv() => {
                let Some(text) = payload else { break };
                let frame = WsMessage::Text(text.as_str().to_owned().into());
                if !send_frame(&mut sink, frame, &connection, config.send_timeout).await {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if connection.idle_for() > config.heartbeat_timeout {
                    warn!(connection_id = %connection.id, "heartbeat timeout");
                    break;
                }
                if !send_frame(&mut sink, WsMessage::Ping(Vec::new().into()), &connection, config.send_timeout).await {
                    break;
                }
                trace!(connection_id = %connection.id, "sent ping");
            }
        }
    }

    connection.close();
    let _ = tokio::time::timeout(config.send_timeout, sink.close()).await;
}

async fn send_frame<W>(sink: &mut W, frame: WsMessage, connection: &Connection, limit: Duration) -> bool
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(connection_id = %connection.id, error = %e, "delivery failed: socket write error");
            false
        }
        Err(_) => {
            warn!(
                connection_id = %connection.id,
                timeout_ms = limit.as_millis() as u64,
                "delivery failed: socket write timed out"
            );
            false
        }
    }
}
