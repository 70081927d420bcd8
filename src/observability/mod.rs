//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured operator events via tracing)
//!     → metrics.rs (counters, gauges)
//!     → diagnostics.rs (verbose negotiation and engine trace)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Metrics endpoint (Prometheus scrape, optional)
//!     → stderr or nowhere (diagnostic sink, per `-e`)
//! ```

pub mod diagnostics;
pub mod logging;
pub mod metrics;
