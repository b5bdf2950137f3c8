//! Store abstraction
//!
//! The aggregation executor, index manager and usage analyzer only talk to a
//! document store through these traits. [`MemoryStore`] is the bundled
//! implementation used for tests and local tooling.

mod eval;
pub mod memory;

pub use memory::MemoryStore;

use crate::aggregation::Pipeline;
use crate::document::Document;
use crate::index::{IndexDefinition, IndexDirection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the implicit primary-key index every collection carries
pub const PRIMARY_INDEX_NAME: &str = "_id_";

/// Options forwarded with every aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOptions {
    /// Allow the store to spill large stages to disk
    pub allow_disk_use: bool,
    /// Server-side execution time limit
    pub max_time: Option<Duration>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            allow_disk_use: true,
            max_time: Some(Duration::from_secs(30)),
        }
    }
}

/// Index as reported by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    /// Ordered key specification
    pub keys: Vec<(String, IndexDirection)>,
    pub unique: bool,
}

/// Access counters since the index was created or the store restarted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAccesses {
    pub ops: u64,
    pub since: DateTime<Utc>,
}

/// Per-index statistics, the `$indexStats` equivalent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAccessStats {
    pub name: String,
    pub accesses: IndexAccesses,
    pub size_bytes: u64,
}

/// Errors raised by a store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Aggregation failed: {0}")]
    Execution(String),

    #[error("Index not found: {collection}.{name}")]
    IndexNotFound { collection: String, name: String },

    #[error("Index already exists: {collection}.{name}")]
    IndexExists { collection: String, name: String },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Operation exceeded time limit of {0:?}")]
    Timeout(Duration),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Runs aggregation pipelines against a collection
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Return the store's plan for `pipeline` without running it
    async fn explain(&self, collection: &str, pipeline: &Pipeline) -> Result<serde_json::Value, StoreError>;
}

/// Index management for collections
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError>;

    /// Create an index, returning the name the store gave it
    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<String, StoreError>;

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError>;

    async fn index_stats(&self, collection: &str) -> Result<Vec<IndexAccessStats>, StoreError>;
}
