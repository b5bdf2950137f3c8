//! Inspi Core - Aggregation pipeline optimization and index management
//!
//! This crate provides the data-access layer shared by Inspi services:
//! - Pipeline model, builder and rule-based optimizer
//! - Execution through a pluggable document store with slow-query logging
//! - The index catalog, its reconciliation against a store and usage analysis
//! - Configuration, structured logging and Prometheus metrics

pub mod aggregation;
pub mod config;
pub mod document;
pub mod index;
pub mod monitoring;
pub mod query;
pub mod store;

pub use aggregation::*;
pub use config::*;
pub use document::*;
pub use index::*;
pub use monitoring::*;
pub use query::*;
pub use store::{
    AggregateOptions, AggregateStore, IndexAccessStats, IndexAccesses, IndexInfo, IndexStore, MemoryStore,
    StoreError, PRIMARY_INDEX_NAME,
};
