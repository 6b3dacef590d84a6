//! Lease handle with use-after-release protection.
//!
//! A `Lease` is a thin wrapper over one checkout. The released flag belongs to
//! the lease, not to the connection: once released, every operation on this
//! handle fails with `UseAfterRelease` and accessors return `None`, while the
//! same connection handed to the next caller comes wrapped in a fresh lease.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::net::{Connection, ConnectionId, ConnectionState, QueryOutput};
use crate::pool::base::{BasePool, Checkout};
use crate::pool::types::{PoolError, PoolResult};

/// A leased connection.
///
/// Dropping an unreleased lease returns the connection to the pool.
#[derive(Debug)]
pub struct Lease {
    checkout: Checkout,
    base: Arc<BasePool>,
}

impl Lease {
    pub(crate) fn new(checkout: Checkout, base: Arc<BasePool>) -> Self {
        Self { checkout, base }
    }

    /// Run a statement on the leased connection.
    ///
    /// Every failure is also published on the pool's error stream. A
    /// terminated connection is published once, whether the lease or the
    /// connection notices first.
    pub async fn execute(&self, statement: &str, params: &[Value]) -> PoolResult<QueryOutput> {
        if self.checkout.is_released() {
            return Err(PoolError::UseAfterRelease);
        }
        let conn = Arc::clone(self.checkout.connection());

        conn.execute(statement, params).await.map_err(|err| {
            self.checkout.error_sink().report(err.clone());
            err.into()
        })
    }

    /// Return the connection to the pool. A second call fails with `UseAfterRelease`.
    pub fn release(&mut self) -> PoolResult<()> {
        match self.checkout.release() {
            // The connection was retired while leased; the lease itself is done.
            Err(PoolError::Vacated(id)) => {
                tracing::debug!(connection_id = %id, "Released lease on a retired connection");
                Err(PoolError::Vacated(id))
            }
            other => other,
        }
    }

    pub fn is_released(&self) -> bool {
        self.checkout.is_released()
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.live().map(|_| self.checkout.id())
    }

    pub fn process_id(&self) -> Option<u32> {
        self.live().and_then(|c| c.connection().process_id())
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.live().map(|c| c.connection().state())
    }

    /// Whether a statement is running or queued on the connection.
    pub fn is_busy(&self) -> Option<bool> {
        self.live().map(|c| c.connection().pending_queries() > 0)
    }

    pub fn lease_started(&self) -> Option<Instant> {
        let checkout = self.live()?;
        self.base.slot(checkout.id()).map(|s| s.lease_start)
    }

    pub(crate) fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.live().map(Checkout::connection)
    }

    fn live(&self) -> Option<&Checkout> {
        (!self.checkout.is_released()).then_some(&self.checkout)
    }
}
