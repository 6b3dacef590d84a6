//! Connectivity watcher.
//!
//! # Responsibilities
//! - Probe the backing service until it answers, then stop
//! - Report each outage once and each recovery once
//! - Keep at most one watcher task alive per pool
//!
//! The watcher is self-terminating: after the first successful probe the task
//! exits and `start()` has to be called again (by the next error) to re-arm it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::lifecycle::LifecycleState;
use crate::net::Probe;
use crate::observability::metrics;

/// Receives connectivity transitions.
pub trait ConnectivityObserver: Send + Sync + 'static {
    /// First failed probe of an outage.
    fn on_disconnected(&self);

    /// Service answered. `announce` is set when this ends an outage or is
    /// the first verdict of a watcher started without a prior error.
    fn on_reachable(&self, announce: bool);
}

pub struct HealthWatcher {
    probe: Arc<dyn Probe>,
    interval: Duration,
    watching: Arc<AtomicBool>,
    connectivity_error: Arc<AtomicBool>,
    observer: Weak<dyn ConnectivityObserver>,
    lifecycle: watch::Receiver<LifecycleState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthWatcher {
    pub fn new(
        probe: Arc<dyn Probe>,
        interval: Duration,
        observer: Weak<dyn ConnectivityObserver>,
        lifecycle: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            probe,
            interval,
            watching: Arc::new(AtomicBool::new(false)),
            connectivity_error: Arc::new(AtomicBool::new(false)),
            observer,
            lifecycle,
            task: Mutex::new(None),
        }
    }

    /// Start watching unless a watcher is already running.
    ///
    /// Returns `true` if this call started the task.
    pub fn start(&self, announce: bool) -> bool {
        if self
            .watching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Health watcher needs a Tokio runtime, not started");
            self.watching.store(false, Ordering::SeqCst);
            return false;
        };

        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "Health watcher starting");
        let run = WatchRun {
            probe: Arc::clone(&self.probe),
            interval: self.interval,
            watching: Arc::clone(&self.watching),
            connectivity_error: Arc::clone(&self.connectivity_error),
            observer: self.observer.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        let task = handle.spawn(run.run(announce));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        true
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Latest verdict: `true` while the last probe failed.
    pub fn connectivity_error(&self) -> bool {
        self.connectivity_error.load(Ordering::SeqCst)
    }

    /// Stop the task if one is running.
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.watching.store(false, Ordering::SeqCst);
    }
}

impl Drop for HealthWatcher {
    fn drop(&mut self) {
        self.abort();
    }
}

struct WatchRun {
    probe: Arc<dyn Probe>,
    interval: Duration,
    watching: Arc<AtomicBool>,
    connectivity_error: Arc<AtomicBool>,
    observer: Weak<dyn ConnectivityObserver>,
    lifecycle: watch::Receiver<LifecycleState>,
}

impl WatchRun {
    async fn run(mut self, mut announce: bool) {
        // First tick completes immediately. A zero period would panic.
        let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outage_reported = false;

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.lifecycle) => {
                    tracing::debug!("Health watcher stopping, pool no longer active");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if self.observer.strong_count() == 0 {
                break;
            }
            let reachable = self.probe.probe().await;
            metrics::record_probe(reachable);
            let Some(observer) = self.observer.upgrade() else {
                break;
            };

            if reachable {
                let was_error = self.connectivity_error.swap(false, Ordering::SeqCst);
                metrics::record_connectivity(true);
                if was_error {
                    tracing::info!("Server host is reachable again");
                }
                observer.on_reachable(announce || was_error);
                break;
            }

            self.connectivity_error.store(true, Ordering::SeqCst);
            metrics::record_connectivity(false);
            if !outage_reported {
                outage_reported = true;
                announce = true;
                tracing::warn!("Server host not reachable");
                observer.on_disconnected();
            }
        }

        self.watching.store(false, Ordering::SeqCst);
    }
}

async fn stopped(lifecycle: &mut watch::Receiver<LifecycleState>) {
    // A closed channel means the pool is gone; treat it as stopped too.
    let _ = lifecycle.wait_for(|state| *state != LifecycleState::Active).await;
}
