//! Monitoring for aggregation and index work
//!
//! This module provides:
//! - Structured logging with tracing and a slow-aggregation log
//! - Prometheus counters and latency histograms

pub mod logging;
pub mod metrics;

pub use logging::*;
pub use metrics::*;
