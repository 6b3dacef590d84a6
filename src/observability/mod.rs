//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges via the `metrics` facade)
//!
//! Consumers:
//!     → stderr (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields carry connection ids and process ids
//! - Metrics are cheap when no exporter is installed
//! - Both are opt-in for library users; the CLI wires them from config

pub mod logging;
pub mod metrics;
