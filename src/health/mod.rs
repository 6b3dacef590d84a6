//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Connectivity watcher (watcher.rs):
//!     Error raised anywhere in the pool
//!     → start() (no-op if already watching)
//!     → Probe now, then every reconnect interval
//!     → First failure: disconnected error event
//!     → First success: ready event, task exits
//!
//! Recovery (recovery.rs):
//!     Error raised with auto-recover on, or checkout found no free slot
//!     → Snapshot ended connections
//!     → Queue their process ids for cancel (auto-cancel)
//!     → Retire each one from the base pool
//!     → Error event for each death nobody had reported yet
//! ```
//!
//! # Design Decisions
//! - Watcher and recovery both guard re-entry with an atomic flag
//! - The watcher holds only a weak reference to the pool
//! - Probe failures are verdicts, never errors

pub mod recovery;
pub mod watcher;

pub use recovery::RecoveryEngine;
pub use watcher::{ConnectivityObserver, HealthWatcher};
