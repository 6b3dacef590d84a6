//! Pool event publication.
//!
//! Subscribers get a `broadcast` receiver; publishing never blocks and never
//! fails when nobody listens. At-most-once delivery per transition is the
//! publisher's job (see `health::watcher`), not the channel's.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::net::ConnectionId;
use crate::pool::types::PoolError;

const EVENT_CAPACITY: usize = 256;

/// Events observable by pool users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// The backing service became reachable.
    Ready { pool_id: Uuid, message: String },

    /// Aggregated error stream. `connection` is set for connection-level errors.
    Error {
        error: PoolError,
        connection: Option<ConnectionId>,
    },
}

impl PoolEvent {
    pub fn is_ready(&self) -> bool {
        matches!(self, PoolEvent::Ready { .. })
    }

    pub fn error(&self) -> Option<&PoolError> {
        match self {
            PoolEvent::Error { error, .. } => Some(error),
            PoolEvent::Ready { .. } => None,
        }
    }
}

/// Fan-out publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn error(&self, error: PoolError, connection: Option<ConnectionId>) {
        self.publish(PoolEvent::Error { error, connection });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
