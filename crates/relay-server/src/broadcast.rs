//! Persist-then-fan-out of chat messages to every live connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{ChatMessage, Identity, MessageLog, RelayError};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::registry::ConnectionRegistry;

/// Counters exposed on the health endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivery_failures: u64,
}

/// Accepts messages from any publisher, records them in the message log and
/// pushes them to every registered connection.
pub struct Broadcaster {
    log: Arc<dyn MessageLog>,
    registry: Arc<ConnectionRegistry>,
    /// Held across append and enqueue so every outbox receives messages in
    /// log order.
    order: Mutex<()>,
    published: AtomicU64,
    delivery_failures: AtomicU64,
}

impl Broadcaster {
    pub fn new(log: Arc<dyn MessageLog>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            log,
            registry,
            order: Mutex::new(()),
            published: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Persist one message, then deliver it to a snapshot of the registry.
    ///
    /// Nothing is delivered unless the append succeeded. A connection that
    /// cannot take the message is removed; the rest still receive it.
    pub fn publish(&self, author: &Identity, body: &str) -> Result<ChatMessage, RelayError> {
        let _order = self.order.lock();

        let message = self.log.append(author.as_str(), body).map_err(|e| {
            error!(author = %author, error = %e, "append failed, message not broadcast");
            e
        })?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let payload = match serde_json::to_string(&message.to_outbound()) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                error!(message_id = message.id, error = %e, "failed to serialize message");
                return Ok(message);
            }
        };

        let targets = self.registry.snapshot();
        let mut delivered = 0usize;
        for connection in &targets {
            match connection.deliver(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        connection_id = %connection.id,
                        message_id = message.id,
                        error = %e,
                        "delivery failed, dropping connection"
                    );
                    let _ = self.registry.remove(&connection.id);
                }
            }
        }

        debug!(
            message_id = message.id,
            author = %author,
            recipients = targets.len(),
            delivered,
            "broadcast message"
        );
        Ok(message)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.published.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
