//! Index manager for reconciling the catalog with a live store
//!
//! Creation is idempotent by index name and strictly sequential. A failure on
//! one definition is logged and counted, never aborting the batch.

use super::catalog::IndexCatalog;
use super::definition::IndexDefinition;
use crate::monitoring::AggregationMetrics;
use crate::store::{IndexStore, StoreError, PRIMARY_INDEX_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a batch creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexCreationSummary {
    pub created: usize,
    /// Already present by name
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<IndexFailure>,
}

impl IndexCreationSummary {
    fn merge(&mut self, other: IndexCreationSummary) {
        self.created += other.created;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }
}

/// One definition that could not be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub collection: String,
    pub name: String,
    pub error: String,
}

/// Catalog entry identified by collection and name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRef {
    pub collection: String,
    pub name: String,
}

impl IndexRef {
    fn new(collection: &str, name: &str) -> Self {
        Self {
            collection: collection.to_string(),
            name: name.to_string(),
        }
    }
}

/// Differences between the catalog and the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexValidationReport {
    pub valid: bool,
    /// In the catalog, absent from the store
    pub missing: Vec<IndexRef>,
    /// In the store, absent from the catalog
    pub extra: Vec<IndexRef>,
}

/// Index manager errors
#[derive(Debug, thiserror::Error)]
pub enum IndexManagerError {
    #[error("No index definition named '{name}' for collection '{collection}'")]
    UnknownDefinition { collection: String, name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies an [`IndexCatalog`] to an [`IndexStore`]
pub struct IndexManager {
    store: Arc<dyn IndexStore>,
    catalog: IndexCatalog,
    metrics: Option<AggregationMetrics>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn IndexStore>, catalog: IndexCatalog) -> Self {
        Self {
            store,
            catalog,
            metrics: None,
        }
    }

    /// Count creation outcomes in `metrics`
    pub fn with_metrics(mut self, metrics: AggregationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    /// Create every catalog index that does not exist yet
    pub async fn create_all_indexes(&self) -> IndexCreationSummary {
        let mut summary = IndexCreationSummary::default();

        for collection in self.catalog.collections() {
            summary.merge(self.create_collection_indexes(collection).await);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_index_outcome("created", summary.created);
            metrics.record_index_outcome("skipped", summary.skipped);
            metrics.record_index_outcome("failed", summary.failed);
        }

        info!(
            created = summary.created,
            skipped = summary.skipped,
            failed = summary.failed,
            "Index creation finished"
        );
        summary
    }

    /// Create the catalog indexes of one collection
    pub async fn create_collection_indexes(&self, collection: &str) -> IndexCreationSummary {
        let mut summary = IndexCreationSummary::default();
        let definitions = self.catalog.for_collection(collection);
        if definitions.is_empty() {
            return summary;
        }

        // when listing fails every create is still attempted
        let existing: BTreeSet<String> = match self.store.list_indexes(collection).await {
            Ok(indexes) => indexes.into_iter().map(|i| i.name).collect(),
            Err(e) => {
                warn!(collection, error = %e, "Failed to list indexes");
                BTreeSet::new()
            }
        };

        for definition in definitions {
            if existing.contains(&definition.name) {
                debug!(collection, index = %definition.name, "Index already exists");
                summary.skipped += 1;
                continue;
            }

            match self.store.create_index(collection, definition).await {
                Ok(name) => {
                    info!(collection, index = %name, kind = ?definition.kind, "Index created");
                    summary.created += 1;
                }
                Err(StoreError::IndexExists { .. }) => {
                    debug!(collection, index = %definition.name, "Index already exists");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(collection, index = %definition.name, error = %e, "Failed to create index");
                    summary.failed += 1;
                    summary.failures.push(IndexFailure {
                        collection: collection.to_string(),
                        name: definition.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        summary
    }

    /// Drop an index by name
    pub async fn drop_index(&self, collection: &str, name: &str) -> Result<(), IndexManagerError> {
        self.store.drop_index(collection, name).await.map_err(|e| {
            error!(collection, index = name, error = %e, "Failed to drop index");
            e
        })?;
        info!(collection, index = name, "Index dropped");
        Ok(())
    }

    /// Drop and recreate an index from its catalog definition
    pub async fn rebuild_index(&self, collection: &str, name: &str) -> Result<(), IndexManagerError> {
        let definition = self.definition(collection, name)?;

        match self.store.drop_index(collection, name).await {
            Ok(()) | Err(StoreError::IndexNotFound { .. }) => {}
            Err(e) => {
                error!(collection, index = name, error = %e, "Failed to drop index for rebuild");
                return Err(e.into());
            }
        }

        self.store
            .create_index(collection, definition)
            .await
            .map_err(|e| {
                error!(collection, index = name, error = %e, "Failed to recreate index");
                e
            })?;

        info!(collection, index = name, "Index rebuilt");
        Ok(())
    }

    fn definition(&self, collection: &str, name: &str) -> Result<&IndexDefinition, IndexManagerError> {
        self.catalog
            .find(collection, name)
            .ok_or_else(|| IndexManagerError::UnknownDefinition {
                collection: collection.to_string(),
                name: name.to_string(),
            })
    }

    /// Compare the catalog against the indexes present in the store
    pub async fn validate_indexes(&self) -> Result<IndexValidationReport, IndexManagerError> {
        let mut report = IndexValidationReport::default();

        for collection in self.catalog.collections() {
            let present: BTreeSet<String> = self
                .store
                .list_indexes(collection)
                .await?
                .into_iter()
                .map(|i| i.name)
                .collect();
            let expected: BTreeSet<&str> = self
                .catalog
                .for_collection(collection)
                .iter()
                .map(|d| d.name.as_str())
                .collect();

            for name in &expected {
                if !present.contains(*name) {
                    report.missing.push(IndexRef::new(collection, name));
                }
            }
            for name in &present {
                if name != PRIMARY_INDEX_NAME && !expected.contains(name.as_str()) {
                    report.extra.push(IndexRef::new(collection, name));
                }
            }
        }

        report.valid = report.missing.is_empty() && report.extra.is_empty();
        if !report.valid {
            warn!(
                missing = report.missing.len(),
                extra = report.extra.len(),
                "Indexes differ from catalog"
            );
        }
        Ok(report)
    }
}
