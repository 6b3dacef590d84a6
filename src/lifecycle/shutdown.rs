//! Shutdown coordination for the pool.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;

use crate::observability::metrics;
use crate::pool::base::BasePool;
use crate::pool::events::EventBus;
use crate::pool::types::PoolError;

/// Pool lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Draining,
    Ended,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Active => "active",
            LifecycleState::Draining => "draining",
            LifecycleState::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Coordinator for graceful shutdown.
///
/// Publishes the lifecycle state on a `watch` channel that long-running tasks
/// (the health watcher) subscribe to.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<LifecycleState>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Active);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Move from Active to Draining. Returns `true` only for the caller that
    /// made the transition.
    pub fn begin(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == LifecycleState::Active {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        })
    }

    pub fn finish(&self) {
        self.tx.send_if_modified(|state| {
            if *state == LifecycleState::Ended {
                false
            } else {
                *state = LifecycleState::Ended;
                true
            }
        });
    }

    pub async fn wait_ended(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|state| *state == LifecycleState::Ended).await;
    }

    /// Drain the pool and close it.
    ///
    /// Queued checkouts are rejected, idle leases whose idle timeout runs out
    /// are reclaimed, and the base pool then waits for everything still busy.
    /// Concurrent callers all resolve when the first drain completes.
    pub async fn drain(&self, base: &Arc<BasePool>, events: &EventBus, default_idle: Option<Duration>) {
        if !self.begin() {
            self.wait_ended().await;
            return;
        }
        tracing::info!("Pool draining");

        let rejected = base.reject_waiters(PoolError::ShuttingDown);
        if rejected > 0 {
            tracing::info!(rejected, "Rejected pending checkouts");
            metrics::record_rejected_waiters(rejected);
        }

        let now = Instant::now();
        let mut reclaims = JoinSet::new();
        for slot in base.snapshot() {
            if !slot.leased || !slot.is_idle() {
                continue;
            }
            let Some(timeout) = slot.idle_timeout.or(default_idle) else {
                continue;
            };
            let remaining = (slot.lease_start + timeout).saturating_duration_since(now);
            let id = slot.id;
            let base = Arc::clone(base);
            let events = events.clone();

            reclaims.spawn(async move {
                tokio::select! {
                    _ = base.wait_released(id) => {}
                    _ = time::sleep(remaining) => {
                        // The holder may have released or started a query meanwhile.
                        match base.force_release(id) {
                            Ok(true) => {
                                tracing::warn!(connection_id = %id, "Reclaimed timed out lease during shutdown");
                                let error = PoolError::ShutdownTimeout(id);
                                metrics::record_forced_reclaim();
                                metrics::record_error(error.kind());
                                events.error(error, Some(id));
                            }
                            Ok(false) => {
                                tracing::debug!(connection_id = %id, "Lease busy at its idle deadline, left to finish");
                            }
                            Err(_) => {}
                        }
                    }
                }
            });
        }
        while reclaims.join_next().await.is_some() {}

        base.close().await;
        self.finish();
        tracing::info!("Pool shut down");
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
