//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! HaPool::shutdown()
//!     → ShutdownController::drain (first caller only, others await the same end)
//!     → Active → Draining: queued checkouts rejected, no new checkouts
//!     → idle leases past their idle timeout reclaimed (ShutdownTimeout event)
//!     → BasePool::close waits for busy leases
//!     → Draining → Ended
//! ```
//!
//! # Design Decisions
//! - Lifecycle state lives in a `watch` channel so background tasks can wait on it
//! - Shutdown never terminates a connection with a statement in flight
//! - Reclaim failures are logged, never abort the drain

pub mod shutdown;

pub use shutdown::{LifecycleState, ShutdownController};
