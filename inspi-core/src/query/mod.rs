//! Filter model for pipeline stages
//!
//! This module provides the typed filter AST, a parser for MongoDB-style
//! filter documents and an evaluator used by the in-memory store

pub mod ast;
pub mod executor;
pub mod parser;

pub use ast::{paths_overlap, Filter, Projection, ProjectionField, Sort, SortOrder};
pub use executor::{FilterEvalError, FilterEvaluator};
pub use parser::{FilterParseError, FilterParser};
