//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listeners, connectors, channels produce:
//!     → logging.rs (structured tracing events with session ids)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every event of one connection attempt carries the same `session` field
//! - Metrics are cheap (atomic increments); recording without an installed
//!   exporter is a no-op

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
