//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! HaPool::checkout (overlay.rs)
//!     → BasePool::try_acquire (base.rs): idle connection or creation slot
//!     → full? recovery pass (auto-recover), then FIFO wait queue
//!     → Connector::connect for a creation slot
//!     → Lease (lease.rs) wraps the checkout
//!     → backend cancel backlog flushed through it (auto-cancel)
//!
//! Errors from anywhere
//!     → PoolInner::raise
//!     → EventBus (events.rs) → subscribers
//!     → watcher start, recovery pass
//! ```
//!
//! # Design Decisions
//! - The released flag belongs to the lease, so a reused connection gets a fresh one
//! - Base pool state sits behind one mutex that is never held across an await
//! - Every hand-out is RAII: dropped leases and abandoned waits return their slot

pub mod base;
pub mod events;
pub mod lease;
pub mod overlay;
pub mod types;

pub use events::{EventBus, PoolEvent};
pub use lease::Lease;
pub use overlay::{HaPool, READY_MESSAGE};
pub use types::{ConnectionStatus, PoolError, PoolResult, PoolStatus};
