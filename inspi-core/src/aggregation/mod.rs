//! Aggregation pipelines
//!
//! This module provides:
//! - The stage model and a chainable pipeline builder
//! - A rule-based pipeline optimizer with change diagnostics
//! - An executor that runs optimized pipelines and reports on them

pub mod builder;
pub mod diagnostics;
pub mod execution;
pub mod optimizer;
pub mod stage;

pub use builder::PipelineBuilder;
pub use diagnostics::{describe_changes, ALREADY_OPTIMAL};
pub use execution::{AggregationExecutor, AggregationOutcome, AggregationReport};
pub use optimizer::{optimize, MatchMergePolicy, OptimizerConfig, PipelineOptimizer, ProjectMergePolicy};
pub use stage::{Accumulator, GroupSpec, LookupSpec, Pipeline, Stage, UnwindSpec};
