//! Connection capability interface and lifecycle tracking.
//!
//! # Responsibilities
//! - Define the capability surface the pool needs from a database connection
//! - Generate unique connection IDs for tracing and pool bookkeeping
//! - Model the connection state machine (Connecting → Connected → Ending → Ended)
//! - Route asynchronous transport failures back to the owning pool

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Statement used to ask the backing service to cancel another backend's work.
pub const CANCEL_BACKEND_STATEMENT: &str = "SELECT pg_cancel_backend($1);";

/// Global counter for connection IDs. Only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Established and able to run statements.
    Connected,
    /// Close requested, transport still open.
    Ending,
    /// Transport permanently closed.
    Ended,
}

impl ConnectionState {
    /// A defunct connection has lost its transport but may still sit in the pool.
    pub fn is_defunct(&self) -> bool {
        matches!(self, ConnectionState::Ended)
    }

    /// Only a fully connected, non-closing connection accepts statements.
    pub fn is_queryable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Result rows of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Value>,
    pub rows_affected: u64,
}

/// Failures reported by connection implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport closed; the connection is unusable from now on.
    #[error("Connection terminated: {0}")]
    Terminated(String),

    /// Statement-level failure on an otherwise healthy connection.
    #[error("{0}")]
    Query(String),

    /// The connection could not be established.
    #[error("Connection attempt failed: {0}")]
    Connect(String),
}

/// Capability interface of a database connection owned by the base pool.
///
/// Implementations use interior mutability: the pool shares one `Arc` between
/// its live set and the caller holding the lease.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug + 'static {
    /// Run a statement with positional parameters.
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryOutput, ConnectionError>;

    /// Close the transport. Must be safe to call on an already ended connection.
    async fn close(&self);

    /// Backend process identifier, used for out-of-band cancellation.
    fn process_id(&self) -> Option<u32>;

    /// Current transport state.
    fn state(&self) -> ConnectionState;

    /// Number of statements running or queued on this connection.
    fn pending_queries(&self) -> usize;

    /// Per-connection idle timeout, overriding the pool default.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    /// Ask the backing service to cancel whatever `process_id` is running.
    async fn cancel_backend(&self, process_id: u32) -> Result<(), ConnectionError> {
        self.execute(CANCEL_BACKEND_STATEMENT, &[Value::from(process_id)])
            .await
            .map(|_| ())
    }
}

/// Factory for new connections, injected into the base pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection. The sink must be kept by the connection to
    /// report transport failures that happen outside of `execute`; failures
    /// returned from `execute` are reported by the lease.
    async fn connect(&self, errors: ErrorSink) -> Result<Arc<dyn Connection>, ConnectionError>;
}

/// Receiver of connection-level error reports.
pub trait ErrorListener: Send + Sync {
    fn connection_error(&self, id: ConnectionId, error: ConnectionError);
}

/// Handle a connection uses to report errors to the pool that owns it.
///
/// Clones share one termination flag: a connection's death is reported once,
/// whoever notices it first.
#[derive(Clone)]
pub struct ErrorSink {
    id: ConnectionId,
    listener: Weak<dyn ErrorListener>,
    terminated: Arc<AtomicBool>,
}

impl ErrorSink {
    pub(crate) fn new(id: ConnectionId, listener: Weak<dyn ErrorListener>) -> Self {
        Self {
            id,
            listener,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A sink not attached to any pool. Reports are dropped.
    pub fn detached() -> Self {
        let listener: Weak<dyn ErrorListener> = Weak::<NoListener>::new();
        Self {
            id: ConnectionId::new(),
            listener,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pool-assigned id of the connection this sink belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Report an error. A no-op once the pool is gone, and for any
    /// termination after the first.
    pub fn report(&self, error: ConnectionError) {
        if matches!(error, ConnectionError::Terminated(_)) && !self.mark_terminated() {
            tracing::trace!(connection_id = %self.id, error = %error, "Termination already reported");
            return;
        }
        match self.listener.upgrade() {
            Some(listener) => listener.connection_error(self.id, error),
            None => tracing::trace!(connection_id = %self.id, error = %error, "Error reported to a dropped pool"),
        }
    }

    /// Flag the connection as reported dead. Returns `false` if it already was.
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").field("id", &self.id).finish()
    }
}

struct NoListener;

impl ErrorListener for NoListener {
    fn connection_error(&self, _id: ConnectionId, _error: ConnectionError) {}
}
