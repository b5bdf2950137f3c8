//! In-memory document store
//!
//! Implements both store traits over documents held in process memory.
//! Every collection carries an implicit `_id_` index once it exists.

use super::eval::{Collections, PipelineEvaluator};
use super::{
    AggregateOptions, AggregateStore, IndexAccessStats, IndexAccesses, IndexInfo, IndexStore, StoreError,
    PRIMARY_INDEX_NAME,
};
use crate::aggregation::{Pipeline, Stage};
use crate::document::{Document, Value, ID_FIELD};
use crate::index::{IndexDefinition, IndexDirection};
use crate::query::FilterEvaluator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

/// Fixed per-entry overhead used by index size estimates
const INDEX_ENTRY_OVERHEAD: u64 = 16;

#[derive(Debug, Clone)]
struct StoredIndex {
    info: IndexInfo,
    definition: Option<IndexDefinition>,
    ops: u64,
    since: DateTime<Utc>,
}

impl StoredIndex {
    fn primary() -> Self {
        Self {
            info: IndexInfo {
                name: PRIMARY_INDEX_NAME.to_string(),
                keys: vec![(ID_FIELD.to_string(), IndexDirection::Ascending)],
                unique: true,
            },
            definition: None,
            ops: 0,
            since: Utc::now(),
        }
    }

    fn leading_field(&self) -> Option<&str> {
        self.info.keys.first().map(|(field, _)| field.as_str())
    }

    /// Estimated size: key bytes plus overhead for every indexed document
    fn size_bytes(&self, docs: &[Document]) -> u64 {
        let filters = FilterEvaluator::new();
        docs.iter()
            .filter(|doc| match &self.definition {
                Some(def) => {
                    let has_keys = def.keys.iter().any(|(f, _)| doc.get_by_path(f).is_some());
                    let sparse_ok = !def.options.sparse || has_keys;
                    let partial_ok = match &def.options.partial_filter {
                        Some(filter) => filters.matches(doc, filter).unwrap_or(false),
                        None => true,
                    };
                    sparse_ok && partial_ok
                }
                None => true,
            })
            .map(|doc| {
                let key_bytes: usize = self
                    .info
                    .keys
                    .iter()
                    .map(|(f, _)| doc.get_by_path(f).map(Value::size_bytes).unwrap_or(1))
                    .sum();
                key_bytes as u64 + INDEX_ENTRY_OVERHEAD
            })
            .sum()
    }
}

/// Store keeping collections and index metadata in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    indexes: RwLock<HashMap<String, Vec<StoredIndex>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_collection(&self, collection: &str) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default();
        self.indexes
            .write()
            .entry(collection.to_string())
            .or_insert_with(|| vec![StoredIndex::primary()]);
    }

    /// Insert a document, creating the collection on first use
    pub fn insert(&self, collection: &str, document: Document) {
        self.ensure_collection(collection);
        if let Some(docs) = self.collections.write().get_mut(collection) {
            docs.push(document);
        }
    }

    pub fn insert_many(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        self.ensure_collection(collection);
        if let Some(docs) = self.collections.write().get_mut(collection) {
            docs.extend(documents);
        }
    }

    /// Snapshot of a collection's documents
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Add `ops` to an index's access counter
    pub fn record_index_access(&self, collection: &str, name: &str, ops: u64) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write();
        let index = indexes
            .get_mut(collection)
            .and_then(|list| list.iter_mut().find(|i| i.info.name == name))
            .ok_or_else(|| StoreError::IndexNotFound {
                collection: collection.to_string(),
                name: name.to_string(),
            })?;
        index.ops = index.ops.saturating_add(ops);
        Ok(())
    }

    /// Index a leading `$match` would use, if any
    fn choose_index(&self, collection: &str, pipeline: &Pipeline) -> Option<String> {
        let fields = match pipeline.stages.first() {
            Some(Stage::Match(filter)) => filter.fields()?,
            _ => return None,
        };

        let indexes = self.indexes.read();
        indexes.get(collection)?.iter().find_map(|index| {
            let leading = index.leading_field()?;
            fields
                .iter()
                .any(|f| f == leading)
                .then(|| index.info.name.clone())
        })
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>, StoreError> {
        if let Some(index) = self.choose_index(collection, pipeline) {
            debug!(collection, index = %index, "Using index for leading $match");
            self.record_index_access(collection, &index, 1)?;
        }

        let collections = self.collections.read();
        let docs = collections.get(collection).cloned().unwrap_or_default();
        PipelineEvaluator::new(&collections, options.max_time).run(docs, pipeline)
    }

    async fn explain(&self, collection: &str, pipeline: &Pipeline) -> Result<serde_json::Value, StoreError> {
        let winning_plan = match self.choose_index(collection, pipeline) {
            Some(index) => json!({ "stage": "IXSCAN", "indexName": index }),
            None => json!({ "stage": "COLLSCAN" }),
        };
        let stages: Vec<&str> = pipeline.iter().map(Stage::name).collect();

        Ok(json!({
            "namespace": collection,
            "stages": stages,
            "pipeline": pipeline.to_json(),
            "queryPlanner": { "winningPlan": winning_plan },
        }))
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError> {
        Ok(self
            .indexes
            .read()
            .get(collection)
            .map(|list| list.iter().map(|i| i.info.clone()).collect())
            .unwrap_or_default())
    }

    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<String, StoreError> {
        self.ensure_collection(collection);

        let mut indexes = self.indexes.write();
        let list = indexes.entry(collection.to_string()).or_default();
        if list.iter().any(|i| i.info.name == definition.name) {
            return Err(StoreError::IndexExists {
                collection: collection.to_string(),
                name: definition.name.clone(),
            });
        }

        list.push(StoredIndex {
            info: IndexInfo {
                name: definition.name.clone(),
                keys: definition.keys.clone(),
                unique: definition.options.unique,
            },
            definition: Some(definition.clone()),
            ops: 0,
            since: Utc::now(),
        });
        Ok(definition.name.clone())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<(), StoreError> {
        let not_found = || StoreError::IndexNotFound {
            collection: collection.to_string(),
            name: name.to_string(),
        };
        if name == PRIMARY_INDEX_NAME {
            return Err(StoreError::Backend("cannot drop the _id_ index".to_string()));
        }

        let mut indexes = self.indexes.write();
        let list = indexes.get_mut(collection).ok_or_else(not_found)?;
        let position = list
            .iter()
            .position(|i| i.info.name == name)
            .ok_or_else(not_found)?;
        list.remove(position);
        Ok(())
    }

    async fn index_stats(&self, collection: &str) -> Result<Vec<IndexAccessStats>, StoreError> {
        let collections = self.collections.read();
        let docs = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;

        let indexes = self.indexes.read();
        Ok(indexes
            .get(collection)
            .map(|list| {
                list.iter()
                    .map(|index| IndexAccessStats {
                        name: index.info.name.clone(),
                        accesses: IndexAccesses {
                            ops: index.ops,
                            since: index.since,
                        },
                        size_bytes: index.size_bytes(docs),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_many(
            "works",
            vec![
                Document::from_json(&json!({ "_id": 1, "status": "published", "likes": 4 })),
                Document::from_json(&json!({ "_id": 2, "status": "draft", "likes": 9 })),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_primary_index_created_with_collection() {
        let store = store();
        let indexes = store.list_indexes("works").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, PRIMARY_INDEX_NAME);

        assert!(store.list_indexes("missing").await.unwrap().is_empty());
        assert!(store.drop_index("works", PRIMARY_INDEX_NAME).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_index_rejected() {
        let store = store();
        let def = IndexDefinition::single("works", "status", "status", IndexDirection::Ascending);

        assert_eq!(store.create_index("works", &def).await.unwrap(), "status");
        assert!(matches!(
            store.create_index("works", &def).await,
            Err(StoreError::IndexExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregate_counts_index_access() {
        let store = store();
        let def = IndexDefinition::single("works", "status", "status", IndexDirection::Ascending);
        store.create_index("works", &def).await.unwrap();

        let pipeline = Pipeline::new(vec![Stage::Match(Filter::eq("status", "published"))]);
        let docs = store
            .aggregate("works", &pipeline, &AggregateOptions::default())
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);

        let stats = store.index_stats("works").await.unwrap();
        let status = stats.iter().find(|s| s.name == "status").unwrap();
        assert_eq!(status.accesses.ops, 1);
        assert!(status.size_bytes > 0);

        let plan = store.explain("works", &pipeline).await.unwrap();
        assert_eq!(plan["queryPlanner"]["winningPlan"]["stage"], "IXSCAN");
    }

    #[tokio::test]
    async fn test_partial_index_size_counts_matching_documents() {
        let store = store();
        let partial = IndexDefinition::partial(
            "works",
            "published_likes",
            &[("likes", IndexDirection::Descending)],
            Filter::eq("status", "published"),
        );
        let full = IndexDefinition::single("works", "likes", "likes", IndexDirection::Descending);
        store.create_index("works", &partial).await.unwrap();
        store.create_index("works", &full).await.unwrap();

        let stats = store.index_stats("works").await.unwrap();
        let size = |name: &str| stats.iter().find(|s| s.name == name).unwrap().size_bytes;
        assert!(size("published_likes") < size("likes"));

        assert!(matches!(
            store.index_stats("missing").await,
            Err(StoreError::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_record_access_unknown_index() {
        let store = store();
        assert!(store.record_index_access("works", "nope", 1).is_err());
        store.record_index_access("works", PRIMARY_INDEX_NAME, 3).unwrap();
    }
}
