//! Human-readable summary of what the optimizer changed

use super::stage::{Pipeline, Stage};

/// Message returned when optimization was a no-op
pub const ALREADY_OPTIMAL: &str = "Pipeline already optimal";

/// Describe the differences between a pipeline and its optimized form.
///
/// Always returns at least one message.
pub fn describe_changes(original: &Pipeline, optimized: &Pipeline) -> Vec<String> {
    if original == optimized {
        return vec![ALREADY_OPTIMAL.to_string()];
    }

    let mut messages = Vec::new();

    if original.len() != optimized.len() {
        messages.push(format!(
            "Pipeline reduced from {} to {} stages",
            original.len(),
            optimized.len()
        ));
    }

    let first_match = original.iter().position(Stage::is_match);
    if let Some(position) = first_match.filter(|p| *p > 0) {
        if optimized.stages.first().map(Stage::is_match).unwrap_or(false) {
            messages.push(format!(
                "$match moved forward from stage {} to stage 1",
                position + 1
            ));
        }
    }

    let merged_matches = original
        .count_where(Stage::is_match)
        .saturating_sub(optimized.count_where(Stage::is_match));
    if merged_matches > 0 {
        messages.push(format!("Merged {} $match stage(s)", merged_matches + 1));
    }

    if sorts_followed_by_limit(optimized) > sorts_followed_by_limit(original) {
        messages.push("$limit moved directly after $sort".to_string());
    }

    let is_project = |s: &Stage| matches!(s, Stage::Project(_));
    let merged_projects = original
        .count_where(is_project)
        .saturating_sub(optimized.count_where(is_project));
    if merged_projects > 0 {
        messages.push(format!("Merged {} $project stage(s)", merged_projects + 1));
    }

    if sub_pipelines(original) != sub_pipelines(optimized) {
        messages.push("Optimized $lookup/$facet sub-pipelines".to_string());
    }

    if messages.is_empty() {
        messages.push("Pipeline stages reordered".to_string());
    }

    messages
}

fn sorts_followed_by_limit(pipeline: &Pipeline) -> usize {
    pipeline
        .stages
        .windows(2)
        .filter(|pair| matches!(pair, [Stage::Sort(_), Stage::Limit(_)]))
        .count()
}

fn sub_pipelines(pipeline: &Pipeline) -> Vec<&Pipeline> {
    pipeline
        .iter()
        .flat_map(|stage| -> Vec<&Pipeline> {
            match stage {
                Stage::Lookup(lookup) => lookup.pipeline.iter().collect(),
                Stage::Facet(facets) => facets.values().collect(),
                _ => Vec::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::optimizer::optimize;
    use crate::query::{Filter, Projection, Sort};

    #[test]
    fn test_no_change_is_optimal() {
        let pipeline = Pipeline::new(vec![Stage::Match(Filter::eq("a", 1i32)), Stage::Limit(3)]);
        assert_eq!(
            describe_changes(&pipeline, &optimize(&pipeline)),
            vec![ALREADY_OPTIMAL.to_string()]
        );
        assert_eq!(
            describe_changes(&Pipeline::default(), &Pipeline::default()),
            vec![ALREADY_OPTIMAL.to_string()]
        );
    }

    #[test]
    fn test_merge_reports_stage_reduction() {
        let pipeline = Pipeline::new(vec![
            Stage::Match(Filter::eq("status", "published")),
            Stage::Project(Projection::new().include("title").include("likes")),
            Stage::Match(Filter::gt("likes", 10i32)),
        ]);

        let optimized = optimize(&pipeline);
        let messages = describe_changes(&pipeline, &optimized);

        assert!(messages.contains(&"Pipeline reduced from 3 to 2 stages".to_string()));
        assert!(messages.contains(&"Merged 2 $match stage(s)".to_string()));
    }

    #[test]
    fn test_hoist_and_limit_messages() {
        let pipeline = Pipeline::new(vec![
            Stage::Sort(Sort::new().desc("likes")),
            Stage::Skip(10),
            Stage::Limit(5),
            Stage::Match(Filter::eq("likes", 3i32)),
        ]);
        // match cannot cross the window, so only the limit moves
        let optimized = optimize(&pipeline);
        let messages = describe_changes(&pipeline, &optimized);
        assert_eq!(messages, vec!["$limit moved directly after $sort".to_string()]);

        let hoisted = Pipeline::new(vec![
            Stage::Sort(Sort::new().desc("likes")),
            Stage::Match(Filter::eq("likes", 3i32)),
        ]);
        let messages = describe_changes(&hoisted, &optimize(&hoisted));
        assert_eq!(messages, vec!["$match moved forward from stage 2 to stage 1".to_string()]);
    }

    #[test]
    fn test_fallback_message() {
        let original = Pipeline::new(vec![Stage::Limit(1), Stage::Skip(1)]);
        let reordered = Pipeline::new(vec![Stage::Skip(1), Stage::Limit(1)]);
        assert_eq!(
            describe_changes(&original, &reordered),
            vec!["Pipeline stages reordered".to_string()]
        );
    }
}
