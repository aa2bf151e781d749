//! Tower middleware for the dispatch pipeline.
//!
//! - [`metrics`]: dispatch timing and outcome counting via `tracing` spans
//!   and the `metrics` facade

pub mod metrics;

pub use metrics::{register_metrics, MetricsLayer};
