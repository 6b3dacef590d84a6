//! High-availability overlay for a database connection pool.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──checkout──▶ ┌──────────────────────────────────────────────┐
//!                        │                  HaPool                      │
//!   caller ◀──Lease───── │  ┌────────┐   ┌──────────┐   ┌───────────┐   │
//!                        │  │ lease  │◀──│   base   │──▶│ Connector │───┼──▶ database
//!                        │  │ proxy  │   │   pool   │   └───────────┘   │
//!                        │  └────────┘   └────▲─────┘                   │
//!                        │                    │ retire                  │
//!   subscribers ◀─events─│  ┌────────┐   ┌────┴─────┐   ┌───────────┐   │
//!                        │  │ event  │◀──│ recovery │   │  health   │───┼──▶ TCP probe
//!                        │  │  bus   │◀──┼──────────┼───│  watcher  │   │
//!                        │  └────────┘   └──────────┘   └───────────┘   │
//!                        │            shutdown controller               │
//!                        └──────────────────────────────────────────────┘
//! ```
//!
//! Database drivers plug in through `net::Connector` and `net::Connection`.

// Core subsystems
pub mod config;
pub mod net;
pub mod pool;

// Availability management
pub mod health;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{Config, PoolConfig};
pub use lifecycle::LifecycleState;
pub use net::{Connection, ConnectionError, ConnectionId, ConnectionState, Connector, ErrorSink, Probe, QueryOutput, TcpProbe};
pub use pool::{HaPool, Lease, PoolError, PoolEvent, PoolResult, PoolStatus};
