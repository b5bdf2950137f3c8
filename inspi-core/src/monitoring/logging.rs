//! Structured logging with tracing
//!
//! Installs the global subscriber and keeps a bounded record of slow
//! aggregations for reporting.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub level: String,

    /// Enable JSON format output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Parse log level from string
    pub fn parse_level(&self) -> Level {
        match self.level.to_uppercase().as_str() {
            "ERROR" => Level::ERROR,
            "WARN" => Level::WARN,
            "INFO" => Level::INFO,
            "DEBUG" => Level::DEBUG,
            "TRACE" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.parse_level().to_string()));

    let subscriber = Registry::default().with(env_filter);

    if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true);

        subscriber
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .compact();

        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    }

    tracing::info!(level = %config.level, json = config.json_format, "Logging initialized");
    Ok(())
}

/// Slow aggregation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowAggregation {
    pub timestamp: DateTime<Utc>,
    pub collection: String,
    pub duration_ms: u64,
    /// Executed pipeline, serialized
    pub pipeline: String,
    pub documents_returned: usize,
}

/// Slow aggregation statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlowAggregationStats {
    pub total_count: usize,
    pub avg_duration_ms: u64,
    pub max_duration_ms: u64,
    pub threshold_ms: u64,
}

/// Bounded log of aggregations that ran at or above a threshold
#[derive(Debug)]
pub struct SlowAggregationLog {
    threshold: Duration,
    capacity: usize,
    entries: RwLock<VecDeque<SlowAggregation>>,
}

impl SlowAggregationLog {
    pub fn new(threshold: Duration, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_slow(&self, duration: Duration) -> bool {
        duration >= self.threshold
    }

    /// Record an execution if it was slow; returns whether it was recorded
    pub fn observe(
        &self,
        collection: &str,
        duration: Duration,
        pipeline: &serde_json::Value,
        documents_returned: usize,
    ) -> bool {
        if !self.is_slow(duration) {
            return false;
        }

        let entry = SlowAggregation {
            timestamp: Utc::now(),
            collection: collection.to_string(),
            duration_ms: duration.as_millis() as u64,
            pipeline: pipeline.to_string(),
            documents_returned,
        };

        tracing::warn!(
            target: "slow_aggregation",
            collection = %entry.collection,
            duration_ms = entry.duration_ms,
            pipeline = %entry.pipeline,
            "Slow aggregation detected"
        );

        let mut entries = self.entries.write();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        true
    }

    /// Most recent slow aggregations, newest first
    pub fn recent(&self, limit: usize) -> Vec<SlowAggregation> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> SlowAggregationStats {
        let entries = self.entries.read();
        let threshold_ms = self.threshold.as_millis() as u64;

        if entries.is_empty() {
            return SlowAggregationStats {
                threshold_ms,
                ..Default::default()
            };
        }

        let total_count = entries.len();
        let total: u64 = entries.iter().map(|e| e.duration_ms).sum();
        SlowAggregationStats {
            total_count,
            avg_duration_ms: total / total_count as u64,
            max_duration_ms: entries.iter().map(|e| e.duration_ms).max().unwrap_or(0),
            threshold_ms,
        }
    }
}
