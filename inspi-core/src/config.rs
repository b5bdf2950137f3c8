//! Configuration management
//!
//! This module provides:
//! - TOML loading and saving with validation
//! - Defaults for the optimizer, executor, usage analyzer and logging
//! - Construction of configured components

use crate::aggregation::{AggregationExecutor, OptimizerConfig, PipelineOptimizer};
use crate::index::{IndexCatalog, IndexUsageAnalyzer, UsageThresholds};
use crate::monitoring::{LoggingConfig, SlowAggregationLog};
use crate::store::{AggregateOptions, AggregateStore, IndexStore};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspiConfig {
    pub optimizer: OptimizerConfig,
    pub execution: ExecutionSettings,
    pub usage: UsageThresholds,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Let the store spill large stages to disk
    pub allow_disk_use: bool,
    /// Server-side time limit; no limit when absent
    pub max_time_ms: Option<u64>,
    /// Executions at or above this are logged as slow
    pub slow_threshold_ms: u64,
    /// Slow executions kept for reporting
    pub slow_log_capacity: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            allow_disk_use: true,
            max_time_ms: Some(30_000),
            slow_threshold_ms: 1_000,
            slow_log_capacity: 1_000,
        }
    }
}

impl ExecutionSettings {
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            allow_disk_use: self.allow_disk_use,
            max_time: self.max_time_ms.map(Duration::from_millis),
        }
    }

    pub fn slow_log(&self) -> SlowAggregationLog {
        SlowAggregationLog::new(
            Duration::from_millis(self.slow_threshold_ms),
            self.slow_log_capacity,
        )
    }
}

impl InspiConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: InspiConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Write configuration as pretty TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.execution.slow_log_capacity == 0 {
            bail!("execution.slow_log_capacity cannot be 0");
        }
        if self.execution.max_time_ms == Some(0) {
            bail!("execution.max_time_ms cannot be 0");
        }

        let below = self.usage.optimize_below;
        if !(below > 0.0 && below <= 100.0) {
            bail!("usage.optimize_below must be in (0, 100], got {}", below);
        }
        if self.usage.size_unit_bytes == 0 {
            bail!("usage.size_unit_bytes cannot be 0");
        }

        Ok(())
    }

    /// Executor wired with the configured optimizer, options and slow log
    pub fn executor(&self, store: Arc<dyn AggregateStore>) -> AggregationExecutor {
        AggregationExecutor::new(
            store,
            PipelineOptimizer::new(self.optimizer.clone()),
            self.execution.aggregate_options(),
            Arc::new(self.execution.slow_log()),
        )
    }

    /// Usage analyzer over every collection in `catalog`
    pub fn usage_analyzer(&self, store: Arc<dyn IndexStore>, catalog: &IndexCatalog) -> IndexUsageAnalyzer {
        IndexUsageAnalyzer::new(
            store,
            catalog.collections().map(str::to_string).collect(),
            self.usage.clone(),
        )
    }
}
