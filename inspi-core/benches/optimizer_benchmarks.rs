//! Pipeline optimizer benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use inspi_core::{optimize, Filter, LookupSpec, Pipeline, PipelineBuilder, Projection, Sort, Stage};
use std::collections::BTreeMap;

/// A pipeline with `depth` blocks of sort / project / match / skip / limit
fn mixed_pipeline(depth: usize) -> Pipeline {
    let mut builder = PipelineBuilder::new();
    for i in 0..depth {
        builder = builder
            .sort(Sort::new().desc("likes"))
            .project(Projection::new().include("title").include("likes").include("status"))
            .match_filter(Filter::eq("status", "published"))
            .skip(i as u64)
            .limit(10);
    }
    builder.build()
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");

    for depth in [1, 4, 16] {
        let pipeline = mixed_pipeline(depth);
        group.bench_with_input(BenchmarkId::new("mixed", depth), &pipeline, |b, pipeline| {
            b.iter(|| optimize(black_box(pipeline)));
        });
    }

    let already_optimal = Pipeline::parse(
        r#"[{"$match": {"status": "published"}}, {"$sort": {"createdAt": -1}}, {"$limit": 20}]"#,
    )
    .expect("valid pipeline");
    group.bench_function("already_optimal", |b| {
        b.iter(|| optimize(black_box(&already_optimal)));
    });

    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let inner = mixed_pipeline(4);
    let mut facets = BTreeMap::new();
    facets.insert("recent".to_string(), inner.clone());
    facets.insert("popular".to_string(), inner.clone());

    let pipeline = Pipeline::new(vec![
        Stage::Lookup(LookupSpec::with_pipeline("works", "works", inner)),
        Stage::Facet(facets),
    ]);

    c.bench_function("optimize_nested", |b| {
        b.iter(|| optimize(black_box(&pipeline)));
    });
}

criterion_group!(benches, bench_optimize, bench_nested);
criterion_main!(benches);
