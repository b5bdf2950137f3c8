//! Aggregation execution with performance reporting
//!
//! Optimizes a pipeline, runs it through the store and reports what was
//! executed, how long it took and what the optimizer changed. Store errors
//! are logged and returned unchanged.

use super::diagnostics::describe_changes;
use super::optimizer::PipelineOptimizer;
use super::stage::Pipeline;
use crate::document::Document;
use crate::monitoring::{AggregationMetrics, SlowAggregationLog};
use crate::store::{AggregateOptions, AggregateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};
use uuid::Uuid;

/// What an execution did and how long it took
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub execution_id: Uuid,
    pub collection: String,
    /// The pipeline actually sent to the store
    pub pipeline: Pipeline,
    pub execution_time: Duration,
    pub documents_returned: usize,
    pub optimizations: Vec<String>,
    pub original_stage_count: usize,
    pub optimized_stage_count: usize,
    pub slow: bool,
}

/// Documents plus the report describing their execution
#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub documents: Vec<Document>,
    pub report: AggregationReport,
}

/// Runs optimized pipelines against an [`AggregateStore`]
pub struct AggregationExecutor {
    store: Arc<dyn AggregateStore>,
    optimizer: PipelineOptimizer,
    options: AggregateOptions,
    slow_log: Arc<SlowAggregationLog>,
    metrics: Option<AggregationMetrics>,
}

impl AggregationExecutor {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        optimizer: PipelineOptimizer,
        options: AggregateOptions,
        slow_log: Arc<SlowAggregationLog>,
    ) -> Self {
        Self {
            store,
            optimizer,
            options,
            slow_log,
            metrics: None,
        }
    }

    /// Count executions in `metrics`
    pub fn with_metrics(mut self, metrics: AggregationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &AggregateOptions {
        &self.options
    }

    pub fn slow_log(&self) -> &SlowAggregationLog {
        &self.slow_log
    }

    /// Optimize and run `pipeline` against `collection`
    pub async fn execute(&self, collection: &str, pipeline: &Pipeline) -> Result<AggregationOutcome, StoreError> {
        let execution_id = Uuid::new_v4();
        let optimized = self.optimizer.optimize(pipeline);
        let optimizations = describe_changes(pipeline, &optimized);
        debug!(%execution_id, collection, optimizations = ?optimizations, "Pipeline optimized");

        let started = Instant::now();
        let documents = match self.store.aggregate(collection, &optimized, &self.options).await {
            Ok(documents) => documents,
            Err(e) => {
                error!(
                    %execution_id,
                    collection,
                    pipeline = %optimized.to_json(),
                    error = %e,
                    "Aggregation failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure();
                }
                return Err(e);
            }
        };
        let execution_time = started.elapsed();

        let slow = self.slow_log.is_slow(execution_time);
        if slow {
            self.slow_log
                .observe(collection, execution_time, &optimized.to_json(), documents.len());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(execution_time, optimized != *pipeline, slow);
        }

        let report = AggregationReport {
            execution_id,
            collection: collection.to_string(),
            original_stage_count: pipeline.len(),
            optimized_stage_count: optimized.len(),
            pipeline: optimized,
            execution_time,
            documents_returned: documents.len(),
            optimizations,
            slow,
        };

        Ok(AggregationOutcome { documents, report })
    }

    /// The store's plan for `pipeline`, as written
    pub async fn explain(&self, collection: &str, pipeline: &Pipeline) -> Result<serde_json::Value, StoreError> {
        self.store.explain(collection, pipeline).await.map_err(|e| {
            error!(
                collection,
                pipeline = %pipeline.to_json(),
                error = %e,
                "Explain failed"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{PipelineBuilder, Stage};
    use crate::query::{Filter, Projection, Sort};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingStore;

    #[async_trait]
    impl AggregateStore for FailingStore {
        async fn aggregate(
            &self,
            _collection: &str,
            _pipeline: &Pipeline,
            _options: &AggregateOptions,
        ) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::Execution("connection reset".to_string()))
        }

        async fn explain(&self, collection: &str, _pipeline: &Pipeline) -> Result<serde_json::Value, StoreError> {
            Err(StoreError::CollectionNotFound(collection.to_string()))
        }
    }

    fn executor(store: Arc<dyn AggregateStore>) -> AggregationExecutor {
        AggregationExecutor::new(
            store,
            PipelineOptimizer::default(),
            AggregateOptions::default(),
            Arc::new(SlowAggregationLog::new(Duration::from_secs(60), 10)),
        )
    }

    fn works() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (id, status, likes) in [(1, "published", 12), (2, "draft", 30), (3, "published", 50)] {
            store.insert(
                "works",
                Document::from_json(&json!({ "_id": id, "status": status, "likes": likes, "title": format!("w{}", id) })),
            );
        }
        store
    }

    #[tokio::test]
    async fn test_execute_reports_optimization() {
        let executor = executor(works());
        let pipeline = PipelineBuilder::new()
            .match_filter(Filter::eq("status", "published"))
            .project(Projection::new().include("title").include("likes"))
            .match_filter(Filter::gt("likes", 20i32))
            .build();

        let outcome = executor.execute("works", &pipeline).await.unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.report.documents_returned, 1);
        assert_eq!(outcome.report.original_stage_count, 3);
        assert_eq!(outcome.report.optimized_stage_count, 2);
        assert!(outcome.report.pipeline.stages[0].is_match());
        assert!(!outcome.report.slow);
        assert!(outcome
            .report
            .optimizations
            .contains(&"Pipeline reduced from 3 to 2 stages".to_string()));
    }

    #[tokio::test]
    async fn test_store_error_propagates_unchanged() {
        let executor = executor(Arc::new(FailingStore));
        let pipeline = Pipeline::new(vec![Stage::Limit(1)]);

        let err = executor.execute("works", &pipeline).await.unwrap_err();
        assert_eq!(err, StoreError::Execution("connection reset".to_string()));

        let err = executor.explain("works", &pipeline).await.unwrap_err();
        assert_eq!(err, StoreError::CollectionNotFound("works".to_string()));
    }

    #[tokio::test]
    async fn test_slow_execution_recorded_and_counted() {
        let metrics = AggregationMetrics::new().unwrap();
        let executor = AggregationExecutor::new(
            works(),
            PipelineOptimizer::default(),
            AggregateOptions::default(),
            Arc::new(SlowAggregationLog::new(Duration::ZERO, 10)),
        )
        .with_metrics(metrics.clone());

        let pipeline = Pipeline::new(vec![Stage::Sort(Sort::new().desc("likes"))]);
        let outcome = executor.execute("works", &pipeline).await.unwrap();

        assert!(outcome.report.slow);
        assert_eq!(outcome.report.optimizations, vec!["Pipeline already optimal".to_string()]);
        assert_eq!(executor.slow_log().recent(1)[0].collection, "works");
        assert_eq!(metrics.executions(), 1);
    }

    #[tokio::test]
    async fn test_fast_execution_not_recorded() {
        let metrics = AggregationMetrics::new().unwrap();
        let executor = executor(works()).with_metrics(metrics.clone());
        let pipeline = Pipeline::new(vec![Stage::Limit(2)]);

        let outcome = executor.execute("works", &pipeline).await.unwrap();
        assert!(!outcome.report.slow);
        assert!(executor.slow_log().recent(10).is_empty());
        assert_eq!(executor.slow_log().stats().total_count, 0);
        assert_eq!(metrics.executions(), 1);
    }

    #[tokio::test]
    async fn test_explain_is_not_optimized() {
        let executor = executor(works());
        let pipeline = Pipeline::new(vec![
            Stage::Sort(Sort::new().asc("likes")),
            Stage::Match(Filter::eq("status", "draft")),
        ]);

        let plan = executor.explain("works", &pipeline).await.unwrap();
        assert_eq!(plan["stages"], json!(["$sort", "$match"]));
    }
}
