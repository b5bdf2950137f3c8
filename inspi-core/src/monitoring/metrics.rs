//! Prometheus metrics for aggregations and index maintenance
//!
//! Metrics live in an owned [`Registry`] so several instances can coexist
//! (one per executor, or one per test) without global state.

use anyhow::Result;
use prometheus::{
    register_counter_vec_with_registry, register_histogram_with_registry,
    register_int_counter_with_registry, CounterVec, Encoder, Histogram, HistogramOpts, IntCounter,
    Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Aggregation and index counters
#[derive(Clone)]
pub struct AggregationMetrics {
    registry: Registry,
    executions: IntCounter,
    failures: IntCounter,
    slow_executions: IntCounter,
    rewrites: IntCounter,
    index_operations: CounterVec,
    duration: Histogram,
}

impl AggregationMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let executions = register_int_counter_with_registry!(
            Opts::new("inspi_aggregations_total", "Total number of aggregations executed"),
            registry
        )?;

        let failures = register_int_counter_with_registry!(
            Opts::new("inspi_aggregation_failures_total", "Total number of failed aggregations"),
            registry
        )?;

        let slow_executions = register_int_counter_with_registry!(
            Opts::new("inspi_slow_aggregations_total", "Aggregations at or above the slow threshold"),
            registry
        )?;

        let rewrites = register_int_counter_with_registry!(
            Opts::new("inspi_pipeline_rewrites_total", "Pipelines changed by the optimizer"),
            registry
        )?;

        let index_operations = register_counter_vec_with_registry!(
            Opts::new("inspi_index_operations_total", "Index maintenance outcomes"),
            &["outcome"],
            registry
        )?;

        let duration = register_histogram_with_registry!(
            HistogramOpts::new("inspi_aggregation_duration_seconds", "Aggregation wall-clock time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            registry
        )?;

        Ok(Self {
            registry,
            executions,
            failures,
            slow_executions,
            rewrites,
            index_operations,
            duration,
        })
    }

    pub fn record_execution(&self, duration: Duration, rewritten: bool, slow: bool) {
        self.executions.inc();
        self.duration.observe(duration.as_secs_f64());
        if rewritten {
            self.rewrites.inc();
        }
        if slow {
            self.slow_executions.inc();
        }
    }

    pub fn record_failure(&self) {
        self.failures.inc();
    }

    /// Count index outcomes, e.g. `created`, `skipped`, `failed`
    pub fn record_index_outcome(&self, outcome: &str, count: usize) {
        self.index_operations
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }

    pub fn executions(&self) -> u64 {
        self.executions.get()
    }

    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format for scraping
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = AggregationMetrics::new().unwrap();
        metrics.record_execution(Duration::from_millis(5), true, false);
        metrics.record_execution(Duration::from_millis(500), false, true);
        metrics.record_failure();

        assert_eq!(metrics.executions(), 2);
        assert_eq!(metrics.failures(), 1);
    }

    #[test]
    fn test_render() {
        let metrics = AggregationMetrics::new().unwrap();
        metrics.record_execution(Duration::from_millis(5), true, false);
        metrics.record_index_outcome("created", 3);

        let text = metrics.render().unwrap();
        assert!(text.contains("inspi_aggregations_total 1"));
        assert!(text.contains("inspi_index_operations_total{outcome=\"created\"} 3"));
        assert!(text.contains("inspi_aggregation_duration_seconds_bucket"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = AggregationMetrics::new().unwrap();
        let b = AggregationMetrics::new().unwrap();
        a.record_failure();
        assert_eq!(b.failures(), 0);
    }
}
