//! Chainable pipeline construction
//!
//! The builder only accumulates stages in call order. Whether the referenced
//! fields exist is for the executing store to decide.

use super::stage::{GroupSpec, LookupSpec, Pipeline, Stage, UnwindSpec};
use crate::query::{Filter, Projection, Sort};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Builder accumulating stages into a [`Pipeline`]
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `$match` stage
    pub fn match_filter(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    /// Append a `$group` stage
    pub fn group(mut self, group: GroupSpec) -> Self {
        self.stages.push(Stage::Group(group));
        self
    }

    /// Append a `$sort` stage
    pub fn sort(mut self, sort: Sort) -> Self {
        self.stages.push(Stage::Sort(sort));
        self
    }

    /// Append a `$limit` stage
    pub fn limit(mut self, count: u64) -> Self {
        self.stages.push(Stage::Limit(count));
        self
    }

    /// Append a `$skip` stage
    pub fn skip(mut self, count: u64) -> Self {
        self.stages.push(Stage::Skip(count));
        self
    }

    /// Append a `$project` stage
    pub fn project(mut self, projection: Projection) -> Self {
        self.stages.push(Stage::Project(projection));
        self
    }

    /// Append a `$lookup` stage
    pub fn lookup(mut self, lookup: LookupSpec) -> Self {
        self.stages.push(Stage::Lookup(lookup));
        self
    }

    /// Append an `$unwind` stage
    pub fn unwind(mut self, unwind: UnwindSpec) -> Self {
        self.stages.push(Stage::Unwind(unwind));
        self
    }

    /// Append an `$addFields` stage
    pub fn add_fields(mut self, fields: BTreeMap<String, JsonValue>) -> Self {
        self.stages.push(Stage::AddFields(fields));
        self
    }

    /// Append a `$facet` stage
    pub fn facet(mut self, facets: BTreeMap<String, Pipeline>) -> Self {
        self.stages.push(Stage::Facet(facets));
        self
    }

    /// Append a `$sample` stage
    pub fn sample(mut self, size: u64) -> Self {
        self.stages.push(Stage::Sample(size));
        self
    }

    /// Copy of the stages accumulated so far
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.stages.clone())
    }

    /// Consume the builder
    pub fn build(self) -> Pipeline {
        Pipeline::new(self.stages)
    }

    /// Number of stages accumulated so far
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::stage::Accumulator;
    use serde_json::json;

    #[test]
    fn test_stages_in_call_order() {
        let pipeline = PipelineBuilder::new()
            .match_filter(Filter::eq("status", "published"))
            .group(GroupSpec::new(json!("$subject")).accumulate("n", Accumulator::Count))
            .sort(Sort::new().desc("n"))
            .skip(2)
            .limit(5)
            .project(Projection::new().include("n"))
            .lookup(LookupSpec::new("subjects", "_id", "code", "subject"))
            .unwind(UnwindSpec::new("subject"))
            .add_fields(BTreeMap::from([("rank".to_string(), json!(1))]))
            .facet(BTreeMap::new())
            .sample(1)
            .build();

        let names: Vec<&str> = pipeline.iter().map(Stage::name).collect();
        assert_eq!(
            names,
            vec![
                "$match",
                "$group",
                "$sort",
                "$skip",
                "$limit",
                "$project",
                "$lookup",
                "$unwind",
                "$addFields",
                "$facet",
                "$sample"
            ]
        );
    }

    #[test]
    fn test_pipeline_is_a_defensive_copy() {
        let builder = PipelineBuilder::new().limit(10);

        let mut copy = builder.pipeline();
        copy.stages.push(Stage::Skip(1));
        copy.stages[0] = Stage::Limit(99);

        assert_eq!(builder.len(), 1);
        assert_eq!(builder.pipeline(), Pipeline::new(vec![Stage::Limit(10)]));
    }
}
