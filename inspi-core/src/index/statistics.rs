//! Index usage analysis
//!
//! Turns store-reported access counters into an efficiency score and a
//! keep / optimize / remove recommendation per index.

use crate::store::{IndexAccessStats, IndexStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;

/// Message reported when no index needs attention
pub const HEALTHY_MESSAGE: &str = "Index usage looks healthy";

/// Tunables for the efficiency heuristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageThresholds {
    /// Efficiency below which a used index is flagged for optimization
    pub optimize_below: f64,
    /// Bytes per size unit in the efficiency ratio
    pub size_unit_bytes: u64,
    /// Total index size above which a storage warning is emitted
    pub storage_warning_bytes: u64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            optimize_below: 30.0,
            size_unit_bytes: MIB,
            storage_warning_bytes: 100 * MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    Optimize,
    Remove,
}

/// Derived usage figures for one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexUsageStat {
    pub name: String,
    pub collection: String,
    pub size_bytes: u64,
    pub ops: u64,
    pub last_used: DateTime<Utc>,
    /// 0 to 100
    pub efficiency: f64,
    pub recommendation: Recommendation,
}

/// Usage across every analyzed collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexUsageReport {
    pub stats: Vec<IndexUsageStat>,
    pub unused: Vec<IndexUsageStat>,
    pub inefficient: Vec<IndexUsageStat>,
    pub total_size_bytes: u64,
    pub recommendations: Vec<String>,
    /// Collections whose statistics could not be read
    pub skipped_collections: Vec<String>,
}

/// Computes [`IndexUsageReport`]s from store statistics
pub struct IndexUsageAnalyzer {
    store: Arc<dyn IndexStore>,
    collections: Vec<String>,
    thresholds: UsageThresholds,
}

impl IndexUsageAnalyzer {
    pub fn new(store: Arc<dyn IndexStore>, collections: Vec<String>, thresholds: UsageThresholds) -> Self {
        Self {
            store,
            collections,
            thresholds,
        }
    }

    /// Score a single index
    pub fn compute_stat(&self, collection: &str, stats: &IndexAccessStats) -> IndexUsageStat {
        let ops = stats.accesses.ops;
        let efficiency = efficiency(ops, stats.size_bytes, self.thresholds.size_unit_bytes);

        let recommendation = if ops == 0 {
            Recommendation::Remove
        } else if efficiency < self.thresholds.optimize_below {
            Recommendation::Optimize
        } else {
            Recommendation::Keep
        };

        IndexUsageStat {
            name: stats.name.clone(),
            collection: collection.to_string(),
            size_bytes: stats.size_bytes,
            ops,
            last_used: stats.accesses.since,
            efficiency,
            recommendation,
        }
    }

    /// Analyze every configured collection
    pub async fn analyze(&self) -> IndexUsageReport {
        let mut report = IndexUsageReport::default();

        for collection in &self.collections {
            let stats = match self.store.index_stats(collection).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Skipping index statistics");
                    report.skipped_collections.push(collection.clone());
                    continue;
                }
            };

            for raw in &stats {
                let stat = self.compute_stat(collection, raw);
                debug!(
                    collection = %collection,
                    index = %stat.name,
                    efficiency = stat.efficiency,
                    recommendation = ?stat.recommendation,
                    "Index usage"
                );

                report.total_size_bytes += stat.size_bytes;
                match stat.recommendation {
                    Recommendation::Remove => report.unused.push(stat.clone()),
                    Recommendation::Optimize => report.inefficient.push(stat.clone()),
                    Recommendation::Keep => {}
                }
                report.stats.push(stat);
            }
        }

        report.recommendations = self.recommendations(&report);
        report
    }

    fn recommendations(&self, report: &IndexUsageReport) -> Vec<String> {
        let mut messages = Vec::new();

        if !report.unused.is_empty() {
            messages.push(format!(
                "{} unused index(es) found; consider removing them",
                report.unused.len()
            ));
        }
        if !report.inefficient.is_empty() {
            messages.push(format!(
                "{} inefficient index(es) found; consider optimizing them",
                report.inefficient.len()
            ));
        }
        if report.total_size_bytes > self.thresholds.storage_warning_bytes {
            messages.push(format!(
                "Total index size is {:.1} MB; review index storage usage",
                report.total_size_bytes as f64 / MIB as f64
            ));
        }

        if messages.is_empty() {
            messages.push(HEALTHY_MESSAGE.to_string());
        }
        messages
    }
}

/// `ops / max(size / unit, 1)`, clamped to 100
fn efficiency(ops: u64, size_bytes: u64, size_unit_bytes: u64) -> f64 {
    if ops == 0 {
        return 0.0;
    }
    let units = (size_bytes as f64 / size_unit_bytes.max(1) as f64).max(1.0);
    (ops as f64 / units).min(100.0)
}
