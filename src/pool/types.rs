//! Pool-level types and error definitions.

use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::net::{ConnectionError, ConnectionId, ConnectionState};

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the pool, to callers or through the event stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Backing service unreachable. Only ever reported through events.
    #[error("Server host not reachable: {0}")]
    Transport(String),

    /// A lease was used after it had been released.
    #[error("Connection lease used after release")]
    UseAfterRelease,

    /// The connection's transport is gone.
    #[error("Connection terminated: {0}")]
    ConnectionDefunct(String),

    /// Statement failure on a healthy connection.
    #[error("Query failed: {0}")]
    Query(String),

    /// An idle lease was reclaimed because its idle timeout ran out during shutdown.
    #[error("Timed out connection {0} released due to pool shutdown")]
    ShutdownTimeout(ConnectionId),

    /// The pool no longer accepts checkouts.
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// No connection became available in time.
    #[error("Timed out waiting for a connection")]
    CheckoutTimeout,

    /// A new connection could not be established.
    #[error("Connection attempt failed: {0}")]
    Connect(String),

    /// The connection already left the pool's live set.
    #[error("Connection {0} is no longer held by the pool")]
    Vacated(ConnectionId),
}

impl PoolError {
    /// Whether raising this error should schedule a recovery pass.
    ///
    /// Statement failures and caller mistakes leave every connection intact.
    pub fn triggers_recovery(&self) -> bool {
        !matches!(
            self,
            PoolError::Query(_) | PoolError::UseAfterRelease | PoolError::ShuttingDown | PoolError::CheckoutTimeout
        )
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::Transport(_) => "transport",
            PoolError::UseAfterRelease => "use_after_release",
            PoolError::ConnectionDefunct(_) => "connection_defunct",
            PoolError::Query(_) => "query",
            PoolError::ShutdownTimeout(_) => "shutdown_timeout",
            PoolError::ShuttingDown => "shutting_down",
            PoolError::CheckoutTimeout => "checkout_timeout",
            PoolError::Connect(_) => "connect",
            PoolError::Vacated(_) => "vacated",
        }
    }
}

impl From<ConnectionError> for PoolError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Terminated(msg) => PoolError::ConnectionDefunct(msg),
            ConnectionError::Query(msg) => PoolError::Query(msg),
            ConnectionError::Connect(msg) => PoolError::Connect(msg),
        }
    }
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub process_id: Option<u32>,
    pub state: ConnectionState,
    pub queryable: bool,
    pub pending_queries: usize,
    pub leased: bool,
    pub idle: bool,
    pub timed_out: bool,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Maximum simultaneous connections.
    pub capacity: usize,
    /// Live connections, defunct ones included.
    pub used: usize,
    /// Slots left before capacity is reached.
    pub free: usize,
    /// Live connections with no statement running or queued.
    pub idle: usize,
    /// Live connections that are not defunct.
    pub alive: usize,
    /// Leases held past their idle timeout.
    pub timed_out: usize,
    /// Live connections whose transport has ended.
    pub defunct: usize,
    /// Checkouts waiting for a connection.
    pub pending: usize,
    /// Latest health watcher verdict.
    pub connectivity_error: bool,
    pub lifecycle: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<ConnectionStatus>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_level_failures_trigger_recovery() {
        assert!(PoolError::ConnectionDefunct("reset".into()).triggers_recovery());
        assert!(PoolError::Transport("down".into()).triggers_recovery());
        assert!(PoolError::Connect("refused".into()).triggers_recovery());
        assert!(!PoolError::Query("syntax".into()).triggers_recovery());
        assert!(!PoolError::UseAfterRelease.triggers_recovery());
    }

    #[test]
    fn connection_errors_map_onto_taxonomy() {
        assert_eq!(
            PoolError::from(ConnectionError::Terminated("eof".into())),
            PoolError::ConnectionDefunct("eof".into())
        );
        assert_eq!(PoolError::from(ConnectionError::Query("bad".into())), PoolError::Query("bad".into()));
    }
}
