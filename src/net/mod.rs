//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Pool needs a connection
//!     → connection.rs (Connector trait establishes it, ErrorSink wired in)
//!     → Connection handed to the base pool
//!
//! Health watcher needs a verdict
//!     → probe.rs (TCP diagnostic exchange)
//!     → reachable / unreachable
//!
//! Connection States:
//!     Connecting → Connected → Ending → Ended
//! ```
//!
//! # Design Decisions
//! - The wire protocol lives behind the `Connection` trait; the pool never parses it
//! - Probes never raise errors; every failure is simply "unreachable"
//! - Asynchronous transport failures flow back through `ErrorSink`, not callbacks

pub mod connection;
pub mod probe;

pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionState, Connector, ErrorListener, ErrorSink, QueryOutput,
};
pub use probe::{Probe, TcpProbe};
