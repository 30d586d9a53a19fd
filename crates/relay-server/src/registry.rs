//! Live connection handles and the registry that owns them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::{ConnectionId, Identity, RelayError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One client's duplex channel, as seen by the broadcaster.
///
/// Outbound payloads go through a bounded outbox drained by the
/// connection's writer task. Closing cancels both the pump and the writer.
pub struct Connection {
    pub id: ConnectionId,
    identity: Identity,
    outbox: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbox.
    pub fn new(identity: Identity, outbox_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(outbox_capacity.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            identity,
            outbox: tx,
            closed: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });
        (connection, rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a payload without waiting. A full or closed outbox is a
    /// delivery failure.
    pub fn deliver(&self, payload: Arc<String>) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.delivery_failed("connection closed"));
        }
        self.outbox.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => self.delivery_failed("outbox full"),
            mpsc::error::TrySendError::Closed(_) => self.delivery_failed("writer gone"),
        })
    }

    /// Send `{"error": {code, message}}` to this client only. Best effort.
    pub fn send_error(&self, error: &RelayError) {
        let frame = serde_json::json!({
            "error": { "code": error.code(), "message": error.to_string() }
        });
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = self.deliver(Arc::new(json));
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from any side.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn delivery_failed(&self, reason: &str) -> RelayError {
        RelayError::DeliveryFailed {
            connection: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Set of live connections keyed by connection id.
///
/// All operations are internally synchronized; fan-out iterates a
/// `snapshot()` rather than the live map.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id.clone(), connection);
    }

    /// Deregister and close a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        connection.close();
        Some(connection)
    }

    /// Point-in-time copy of the current members.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }
}
