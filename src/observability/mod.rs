//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! ForwardEngine
//!     → stats.rs (per-request telemetry, reports for the admin API)
//!     → log_stream.rs (operator-facing log fan-out, SSE)
//!     → metrics.rs (Prometheus counters and histograms)
//! everything
//!     → logging.rs (tracing subscriber)
//! ```

pub mod log_stream;
pub mod logging;
pub mod metrics;
pub mod stats;
