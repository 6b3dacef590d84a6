//! Defunct connection recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::observability::metrics;
use crate::pool::base::BasePool;
use crate::pool::events::EventBus;
use crate::pool::types::PoolError;

const SILENT_DEATH: &str = "connection ended without reporting an error";

/// Sweeps ended connections out of the pool.
///
/// One pass at a time per pool: a trigger arriving while a pass runs is
/// dropped, the next error will trigger again.
#[derive(Debug)]
pub struct RecoveryEngine {
    recovering: AtomicBool,
    auto_cancel: bool,
    /// Process ids still owing a backend cancel request.
    backlog: Mutex<Vec<u32>>,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecoveryEngine {
    pub fn new(auto_cancel: bool) -> Self {
        Self {
            recovering: AtomicBool::new(false),
            auto_cancel,
            backlog: Mutex::new(Vec::new()),
        }
    }

    /// Retire every ended connection.
    ///
    /// Deaths no one reported yet are published on `events` directly, not
    /// raised, so a pass never schedules another.
    ///
    /// Returns `true` iff there was something to retire and every connection
    /// found ended at the start of the pass has left the pool.
    pub fn recover(&self, base: &Arc<BasePool>, events: &EventBus) -> bool {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Recovery already in progress");
            return false;
        }
        let _guard = PassGuard(&self.recovering);

        let defunct = base.defunct();
        if defunct.is_empty() {
            return false;
        }
        tracing::info!(count = defunct.len(), "Recovering defunct connections");

        for slot in &defunct {
            if self.auto_cancel {
                if let Some(pid) = slot.process_id {
                    self.backlog.lock().unwrap_or_else(PoisonError::into_inner).push(pid);
                    metrics::record_cancel_queued();
                }
            }
            // Already vacated is fine.
            if let Err(e) = base.retire(slot.id) {
                tracing::debug!(connection_id = %slot.id, error = %e, "Defunct connection already gone");
            }
            if slot.sink.mark_terminated() {
                let error = PoolError::ConnectionDefunct(SILENT_DEATH.to_string());
                tracing::warn!(connection_id = %slot.id, process_id = ?slot.process_id, "Retired connection that ended unreported");
                metrics::record_error(error.kind());
                events.error(error, Some(slot.id));
            }
        }

        let remaining = defunct.iter().filter(|slot| base.contains(slot.id)).count();
        let retired = defunct.len() - remaining;
        metrics::record_recovered(retired);
        if remaining > 0 {
            tracing::warn!(retired, remaining, "Recovery pass incomplete");
        }
        remaining == 0
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Take every queued process id, leaving the backlog empty.
    pub fn take_backlog(&self) -> Vec<u32> {
        std::mem::take(&mut *self.backlog.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
