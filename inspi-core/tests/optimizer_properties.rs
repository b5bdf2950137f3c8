//! Property tests for the pipeline optimizer
//!
//! - Optimization never mutates its input and never adds stages
//! - Optimizing twice changes nothing
//! - Optimized pipelines return the same documents as the original

use inspi_core::{
    optimize, AggregateOptions, AggregateStore, Document, Filter, MemoryStore, Pipeline, Projection, Sort, Stage,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

fn row_stage() -> impl Strategy<Value = Stage> {
    prop_oneof![
        (0i32..60).prop_map(|n| Stage::Match(Filter::gt("likes", n))),
        prop::sample::select(vec!["published", "draft", "archived"])
            .prop_map(|status| Stage::Match(Filter::eq("status", status))),
        any::<bool>().prop_map(|asc| {
            let sort = if asc {
                Sort::new().asc("likes")
            } else {
                Sort::new().desc("likes")
            };
            Stage::Sort(sort)
        }),
        (0u64..5).prop_map(Stage::Skip),
        (0u64..8).prop_map(Stage::Limit),
    ]
}

fn any_stage() -> impl Strategy<Value = Stage> {
    prop_oneof![
        4 => row_stage(),
        1 => prop::sample::subsequence(vec!["title", "likes", "status"], 1..=3).prop_map(|fields| {
            Stage::Project(fields.into_iter().fold(Projection::new(), |p, f| p.include(f)))
        }),
        1 => (0i32..10).prop_map(|n| {
            let mut fields = BTreeMap::new();
            fields.insert("score".to_string(), json!(n));
            Stage::AddFields(fields)
        }),
    ]
}

fn pipeline_of(stage: impl Strategy<Value = Stage>) -> impl Strategy<Value = Pipeline> {
    prop::collection::vec(stage, 0..8).prop_map(Pipeline::new)
}

fn works_store() -> MemoryStore {
    let store = MemoryStore::new();
    let statuses = ["published", "draft", "archived"];
    store.insert_many(
        "works",
        (0..24).map(|i| {
            Document::from_json(&json!({
                "_id": i,
                "title": format!("work {}", i),
                "status": statuses[i % 3],
                "likes": (i * 7) % 13 * 5,
            }))
        }),
    );
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn optimize_is_pure_and_idempotent(pipeline in pipeline_of(any_stage())) {
        let snapshot = pipeline.clone();
        let once = optimize(&pipeline);
        let twice = optimize(&once);

        prop_assert_eq!(&pipeline, &snapshot);
        prop_assert_eq!(&once, &twice);
        prop_assert!(once.len() <= pipeline.len());
    }

    #[test]
    fn optimize_preserves_results(pipeline in pipeline_of(row_stage())) {
        let store = works_store();
        let options = AggregateOptions::default();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let optimized = optimize(&pipeline);
        let (expected, actual) = runtime.block_on(async {
            (
                store.aggregate("works", &pipeline, &options).await.unwrap(),
                store.aggregate("works", &optimized, &options).await.unwrap(),
            )
        });

        prop_assert_eq!(expected, actual);
    }
}
