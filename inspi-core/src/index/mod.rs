//! Index management for Inspi collections
//!
//! This module provides:
//! - Declarative index definitions and the application catalog
//! - Reconciliation of the catalog against a live store
//! - Usage analysis with keep / optimize / remove recommendations

pub mod catalog;
pub mod definition;
pub mod manager;
pub mod statistics;

pub use catalog::IndexCatalog;
pub use definition::{CatalogError, IndexDefinition, IndexDirection, IndexKind, IndexOptions};
pub use manager::{
    IndexCreationSummary, IndexFailure, IndexManager, IndexManagerError, IndexRef, IndexValidationReport,
};
pub use statistics::{
    IndexUsageAnalyzer, IndexUsageReport, IndexUsageStat, Recommendation, UsageThresholds, HEALTHY_MESSAGE,
};
