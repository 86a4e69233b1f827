//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch / relay / capture
//!     → logging.rs (structured tracing events, requestID on every line)
//!     → metrics.rs (cycle outcomes, artifact losses, cycle latency)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Capture events for observers go through the collaborator, not logs
//! - Metrics are recorded unconditionally; without an installed exporter
//!   the macros are no-ops

pub mod logging;
pub mod metrics;
