//! Pipeline optimizer
//!
//! Rewrites a pipeline into an equivalent, cheaper one. Rules run in a fixed
//! order and the whole sequence repeats until the pipeline stops changing.
//! Every rule only moves stages left or removes them, so the loop ends.
//!
//! 1. hoist `$match` stages as early as the preceding stages allow
//! 2. merge adjacent `$match` stages
//! 3. move `$limit` directly after `$sort` (top-k)
//! 4. merge adjacent `$project` stages
//! 5. optimize `$lookup` and `$facet` sub-pipelines recursively

use super::stage::{Pipeline, Stage};
use crate::query::{paths_overlap, Projection, ProjectionField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// How adjacent `$match` filters are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMergePolicy {
    /// AND every conjunct, so two bounds on one field both survive
    #[default]
    Conjoin,
    /// Later predicates on a field replace earlier ones
    Overwrite,
}

/// How adjacent `$project` stages are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectMergePolicy {
    /// Field-wise union, later specification wins on collision
    #[default]
    Union,
    /// Only merge when the composed projection is exactly equivalent
    Compose,
}

/// Optimizer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub match_merge: MatchMergePolicy,
    pub project_merge: ProjectMergePolicy,
}

/// Pure pipeline rewriter
#[derive(Debug, Clone, Default)]
pub struct PipelineOptimizer {
    config: OptimizerConfig,
}

impl PipelineOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Return an optimized copy of `pipeline`
    pub fn optimize(&self, pipeline: &Pipeline) -> Pipeline {
        let mut current = pipeline.stages.clone();
        let mut pass = 0usize;

        loop {
            let next = self.apply_rules(current.clone());
            if next == current {
                trace!(pass, "pipeline reached fixpoint");
                break;
            }
            current = next;
            pass += 1;
        }

        Pipeline::new(current)
    }

    fn apply_rules(&self, stages: Vec<Stage>) -> Vec<Stage> {
        let stages = hoist_matches(stages);
        let stages = self.merge_matches(stages);
        let stages = push_limits_after_sorts(stages);
        let stages = self.merge_projects(stages);
        self.optimize_sub_pipelines(stages)
    }

    fn merge_matches(&self, stages: Vec<Stage>) -> Vec<Stage> {
        let mut merged: Vec<Stage> = Vec::with_capacity(stages.len());

        for stage in stages {
            if let Stage::Match(next) = &stage {
                if let Some(Stage::Match(prev)) = merged.last_mut() {
                    *prev = match self.config.match_merge {
                        MatchMergePolicy::Conjoin => prev.conjoin(next),
                        MatchMergePolicy::Overwrite => prev.overwrite(next),
                    };
                    continue;
                }
            }
            merged.push(stage);
        }

        merged
    }

    fn merge_projects(&self, stages: Vec<Stage>) -> Vec<Stage> {
        let mut merged: Vec<Stage> = Vec::with_capacity(stages.len());

        for stage in stages {
            if let Stage::Project(next) = &stage {
                if let Some(Stage::Project(prev)) = merged.last_mut() {
                    let combined = match self.config.project_merge {
                        ProjectMergePolicy::Union => union_projections(prev, next),
                        ProjectMergePolicy::Compose => compose_projections(prev, next),
                    };
                    if let Some(combined) = combined {
                        *prev = combined;
                        continue;
                    }
                }
            }
            merged.push(stage);
        }

        merged
    }

    fn optimize_sub_pipelines(&self, stages: Vec<Stage>) -> Vec<Stage> {
        stages
            .into_iter()
            .map(|stage| match stage {
                Stage::Lookup(mut lookup) => {
                    lookup.pipeline = lookup.pipeline.map(|p| self.optimize(&p));
                    Stage::Lookup(lookup)
                }
                Stage::Facet(facets) => Stage::Facet(
                    facets
                        .into_iter()
                        .map(|(name, p)| (name, self.optimize(&p)))
                        .collect(),
                ),
                other => other,
            })
            .collect()
    }
}

/// Move every `$match` left across stages it commutes with.
///
/// Matches never pass each other, so their relative order is preserved.
fn hoist_matches(mut stages: Vec<Stage>) -> Vec<Stage> {
    for i in 0..stages.len() {
        let fields = match &stages[i] {
            Stage::Match(filter) => filter.fields(),
            _ => continue,
        };
        // opaque filters ($expr, $text, ...) stay where they were written
        let Some(fields) = fields else { continue };

        let mut j = i;
        while j > 0 && commutes_with_match(&stages[j - 1], &fields) {
            stages.swap(j - 1, j);
            j -= 1;
        }
    }
    stages
}

/// Whether a `$match` on `fields` may run before `stage` without changing results
fn commutes_with_match(stage: &Stage, fields: &[String]) -> bool {
    match stage {
        Stage::Sort(_) => true,
        Stage::Project(projection) => fields.iter().all(|f| projection.passes_through(f)),
        Stage::AddFields(added) => !added
            .keys()
            .any(|key| fields.iter().any(|f| paths_overlap(key, f))),
        Stage::Lookup(lookup) => !fields.iter().any(|f| paths_overlap(&lookup.as_field, f)),
        Stage::Unwind(unwind) => !fields.iter().any(|f| paths_overlap(&unwind.path, f)),
        Stage::Match(_)
        | Stage::Group(_)
        | Stage::Limit(_)
        | Stage::Skip(_)
        | Stage::Facet(_)
        | Stage::Sample(_) => false,
    }
}

/// Move a `$limit` found after a run of `$skip`s to directly follow its `$sort`.
///
/// The limit grows by the skipped count: `[sort, skip 5, limit 10]` becomes
/// `[sort, limit 15, skip 5]`.
fn push_limits_after_sorts(mut stages: Vec<Stage>) -> Vec<Stage> {
    for i in 0..stages.len() {
        if !matches!(stages[i], Stage::Sort(_)) {
            continue;
        }

        let mut skipped: u64 = 0;
        let mut j = i + 1;
        while let Some(Stage::Skip(n)) = stages.get(j) {
            skipped = skipped.saturating_add(*n);
            j += 1;
        }

        if j == i + 1 {
            continue;
        }
        if let Some(Stage::Limit(n)) = stages.get(j) {
            let limit = n.saturating_add(skipped);
            stages.remove(j);
            stages.insert(i + 1, Stage::Limit(limit));
        }
    }
    stages
}

/// Later fields overwrite earlier ones. Refuses to mix inclusions and
/// exclusions of ordinary fields since stores reject such projections.
fn union_projections(prev: &Projection, next: &Projection) -> Option<Projection> {
    let mut fields = prev.fields.clone();
    fields.extend(next.fields.clone());
    let merged = Projection { fields };

    let excludes_field = merged
        .fields
        .iter()
        .any(|(name, kind)| matches!(kind, ProjectionField::Exclude) && name != "_id");
    if merged.is_inclusion() && excludes_field {
        return None;
    }
    Some(merged)
}

/// Exact composition of two projections applied one after the other
fn compose_projections(prev: &Projection, next: &Projection) -> Option<Projection> {
    if prev.is_pure_exclusion() && next.is_pure_exclusion() {
        let mut fields = prev.fields.clone();
        fields.extend(next.fields.clone());
        return Some(Projection { fields });
    }

    if !(prev.is_pure_inclusion() && next.is_pure_inclusion()) {
        return None;
    }

    let included = |p: &Projection| -> Vec<String> {
        p.fields
            .iter()
            .filter(|(name, kind)| matches!(kind, ProjectionField::Include) && *name != "_id")
            .map(|(name, _)| name.clone())
            .collect()
    };
    let id_excluded = |p: &Projection| matches!(p.fields.get("_id"), Some(ProjectionField::Exclude));

    let mut fields = BTreeMap::new();
    for a in included(prev) {
        for b in included(next) {
            if paths_overlap(&a, &b) {
                let deeper = if a.len() >= b.len() { a.clone() } else { b.clone() };
                fields.insert(deeper, ProjectionField::Include);
            }
        }
    }

    if id_excluded(prev) || id_excluded(next) {
        if fields.is_empty() {
            return None;
        }
        fields.insert("_id".to_string(), ProjectionField::Exclude);
    } else if fields.is_empty() {
        fields.insert("_id".to_string(), ProjectionField::Include);
    }

    Some(Projection { fields })
}

/// Helper for callers that only need the default optimizer
pub fn optimize(pipeline: &Pipeline) -> Pipeline {
    PipelineOptimizer::default().optimize(pipeline)
}
