//! High-availability pool overlay.
//!
//! `HaPool` owns the base pool and the components layered over it: the
//! event bus, the connectivity watcher, the recovery engine and the shutdown
//! controller. Every error, whether raised by the overlay or reported through
//! a connection's `ErrorSink`, goes through `PoolInner::raise`. The exceptions
//! are recovery and shutdown findings, which publish directly so they cannot
//! re-trigger a pass.

use std::sync::{Arc, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::health::{ConnectivityObserver, HealthWatcher, RecoveryEngine};
use crate::lifecycle::{LifecycleState, ShutdownController};
use crate::net::{ConnectionError, ConnectionId, Connector, ErrorListener, Probe, QueryOutput, TcpProbe};
use crate::observability::metrics;
use crate::pool::base::{Acquire, BasePool, Grant, SlotInfo};
use crate::pool::events::{EventBus, PoolEvent};
use crate::pool::lease::Lease;
use crate::pool::types::{ConnectionStatus, PoolError, PoolResult, PoolStatus};

/// Message carried by the ready event.
pub const READY_MESSAGE: &str = "Server host is reachable.";

/// Connection pool with liveness watching, defunct connection recovery and
/// use-after-release protection.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct HaPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: Uuid,
    config: PoolConfig,
    base: Arc<BasePool>,
    events: EventBus,
    watcher: HealthWatcher,
    recovery: RecoveryEngine,
    lifecycle: ShutdownController,
    this: Weak<PoolInner>,
}

impl HaPool {
    /// Build a pool probing `config.host:config.port` over TCP.
    ///
    /// Must be called inside a Tokio runtime: the connectivity watcher starts
    /// immediately and announces the first successful probe.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let probe = Arc::new(TcpProbe::new(config.host.clone(), config.port, config.probe_timeout()));
        Self::with_probe(config, connector, probe)
    }

    pub fn with_probe(config: PoolConfig, connector: Arc<dyn Connector>, probe: Arc<dyn Probe>) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<PoolInner>| {
            let listener: Weak<dyn ErrorListener> = this.clone();
            let observer: Weak<dyn ConnectivityObserver> = this.clone();
            let lifecycle = ShutdownController::new();
            let watcher = HealthWatcher::new(probe, config.reconnect_interval(), observer, lifecycle.subscribe());

            PoolInner {
                id: Uuid::new_v4(),
                base: BasePool::new(connector, config.capacity, listener),
                events: EventBus::new(),
                watcher,
                recovery: RecoveryEngine::new(config.auto_cancel),
                lifecycle,
                config,
                this: this.clone(),
            }
        });

        tracing::info!(
            pool_id = %inner.id,
            host = %inner.config.host,
            port = inner.config.port,
            capacity = inner.config.capacity,
            auto_recover = inner.config.auto_recover,
            auto_cancel = inner.config.auto_cancel,
            "Pool created"
        );
        inner.watcher.start(true);

        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Subscribe to ready and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Lease a connection.
    ///
    /// If the pool is full and auto-recover is on, one recovery pass runs
    /// before queueing. With auto-cancel on, queued backend cancellations are
    /// sent through the fresh connection before it is returned.
    pub async fn checkout(&self) -> PoolResult<Lease> {
        let inner = &self.inner;
        if !inner.lifecycle.is_active() {
            metrics::record_checkout("rejected");
            return Err(PoolError::ShuttingDown);
        }

        let grant = match inner.base.try_acquire()? {
            Some(grant) => grant,
            None => {
                if inner.config.auto_recover {
                    inner.recovery.recover(&inner.base, &inner.events);
                }
                self.wait_for_grant().await?
            }
        };

        let checkout = match grant {
            Grant::Ready(checkout) => checkout,
            Grant::Create(reservation) => match inner.base.establish(reservation).await {
                Ok(checkout) => checkout,
                Err(err) => {
                    if matches!(err, PoolError::Connect(_)) {
                        inner.raise(err.clone(), None);
                    }
                    metrics::record_checkout("failed");
                    return Err(err);
                }
            },
        };

        inner.base.stamp_lease(checkout.id());
        tracing::debug!(connection_id = %checkout.id(), "Connection leased");
        let lease = Lease::new(checkout, Arc::clone(&inner.base));

        if inner.config.auto_cancel {
            inner.cancel_backlog(&lease).await;
        }
        metrics::record_checkout("ok");
        Ok(lease)
    }

    async fn wait_for_grant(&self) -> PoolResult<Grant> {
        let base = &self.inner.base;
        let rx = match base.acquire_or_queue()? {
            Acquire::Granted(grant) => return Ok(grant),
            Acquire::Queued(rx) => rx,
        };

        let received = match self.inner.config.checkout_timeout() {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    base.prune_waiters();
                    metrics::record_checkout("timeout");
                    return Err(PoolError::CheckoutTimeout);
                }
            },
            None => rx.await,
        };
        // A dropped sender means the pool closed underneath us.
        received.unwrap_or(Err(PoolError::ShuttingDown))
    }

    /// Check out, run one statement and release, whatever the outcome.
    pub async fn execute(&self, statement: &str, params: &[Value]) -> PoolResult<QueryOutput> {
        let mut lease = self.checkout().await?;
        let result = lease.execute(statement, params).await;
        if let Err(e) = lease.release() {
            tracing::debug!(error = %e, "Release after execute failed");
        }
        result
    }

    /// Run one recovery pass now. See `RecoveryEngine::recover`.
    pub fn recover(&self) -> bool {
        self.inner.recovery.recover(&self.inner.base, &self.inner.events)
    }

    /// Drain and close the pool. Concurrent calls resolve together.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner
            .lifecycle
            .drain(&inner.base, &inner.events, inner.config.idle_timeout())
            .await;
        inner.watcher.abort();
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watcher.is_watching()
    }

    pub fn connectivity_error(&self) -> bool {
        self.inner.watcher.connectivity_error()
    }

    /// Process ids still waiting for a backend cancel request.
    pub fn cancel_backlog(&self) -> usize {
        self.inner.recovery.backlog_len()
    }

    pub fn status(&self, with_connections: bool) -> PoolStatus {
        let inner = &self.inner;
        let slots = inner.base.snapshot();
        let now = Instant::now();
        let default_idle = inner.config.idle_timeout();
        let timed_out = |slot: &SlotInfo| {
            slot.leased
                && slot
                    .idle_timeout
                    .or(default_idle)
                    .is_some_and(|limit| slot.lease_start + limit <= now)
        };

        let capacity = inner.base.capacity();
        let used = slots.len();
        let defunct = slots.iter().filter(|s| s.state.is_defunct()).count();
        let status = PoolStatus {
            capacity,
            used,
            free: capacity.saturating_sub(used),
            idle: slots.iter().filter(|s| s.is_idle()).count(),
            alive: used - defunct,
            timed_out: slots.iter().filter(|s| timed_out(*s)).count(),
            defunct,
            pending: inner.base.pending(),
            connectivity_error: inner.watcher.connectivity_error(),
            lifecycle: inner.lifecycle.state(),
            connections: with_connections.then(|| {
                slots
                    .iter()
                    .map(|s| ConnectionStatus {
                        id: s.id,
                        process_id: s.process_id,
                        state: s.state,
                        queryable: s.state.is_queryable(),
                        pending_queries: s.pending_queries,
                        leased: s.leased,
                        idle: s.is_idle(),
                        timed_out: timed_out(s),
                    })
                    .collect()
            }),
        };
        metrics::record_pool_status(&status);
        status
    }
}

impl std::fmt::Debug for HaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaPool")
            .field("id", &self.inner.id)
            .field("lifecycle", &self.inner.lifecycle.state())
            .field("base", &self.inner.base)
            .finish()
    }
}

impl PoolInner {
    /// Single entry point for every pool error.
    fn raise(&self, error: PoolError, connection: Option<ConnectionId>) {
        tracing::warn!(pool_id = %self.id, kind = error.kind(), connection_id = ?connection, error = %error, "Pool error");
        metrics::record_error(error.kind());

        let recover = self.config.auto_recover && error.triggers_recovery();
        self.events.error(error, connection);

        if self.lifecycle.is_active() {
            self.watcher.start(false);
        }
        if recover {
            self.schedule_recovery();
        }
    }

    fn schedule_recovery(&self) {
        if self.recovery.is_recovering() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    this.recovery.recover(&this.base, &this.events);
                });
            }
            Err(_) => {
                this.recovery.recover(&this.base, &this.events);
            }
        }
    }

    async fn cancel_backlog(&self, lease: &Lease) {
        let pids = self.recovery.take_backlog();
        if pids.is_empty() {
            return;
        }
        let Some(conn) = lease.connection() else {
            return;
        };

        tracing::info!(count = pids.len(), connection_id = ?lease.id(), "Cancelling orphaned backend work");
        for pid in pids {
            match conn.cancel_backend(pid).await {
                Ok(_) => {
                    tracing::debug!(process_id = pid, "Backend cancel sent");
                    metrics::record_cancel_attempt(true);
                }
                Err(e) => {
                    tracing::debug!(process_id = pid, error = %e, "Backend cancel failed");
                    metrics::record_cancel_attempt(false);
                }
            }
        }
    }
}

impl ErrorListener for PoolInner {
    fn connection_error(&self, id: ConnectionId, error: ConnectionError) {
        self.raise(error.into(), Some(id));
    }
}

impl ConnectivityObserver for PoolInner {
    fn on_disconnected(&self) {
        let target = format!("{}:{}", self.config.host, self.config.port);
        self.raise(PoolError::Transport(target), None);
    }

    fn on_reachable(&self, announce: bool) {
        if announce {
            tracing::info!(pool_id = %self.id, "{READY_MESSAGE}");
            self.events.publish(PoolEvent::Ready {
                pool_id: self.id,
                message: READY_MESSAGE.to_string(),
            });
        }

        if self.config.auto_cancel && self.recovery.backlog_len() > 0 && self.lifecycle.is_active() {
            let Some(this) = self.this.upgrade() else {
                return;
            };
            // One checkout/release cycle flushes the cancel backlog.
            tokio::spawn(async move {
                let pool = HaPool { inner: this };
                match pool.checkout().await {
                    Ok(mut lease) => {
                        if let Err(e) = lease.release() {
                            tracing::debug!(error = %e, "Release after cancel flush failed");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Cancel flush checkout failed"),
                }
            });
        }
    }
}
