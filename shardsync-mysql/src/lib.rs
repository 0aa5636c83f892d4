//! MySQL table descriptors for the shard-DDL coordinator.
//!
//! This crate provides the engine-native description of a table (columns,
//! indexes, charset) together with the two operations the coordinator is
//! built on: a partial-order comparison between schemas and a least-upper-bound
//! join that merges the schemas of concurrently evolving upstream shards.

pub mod types;

pub use types::{
    AlterOp, ColumnSchema, IndexSchema, SchemaJoinError, TableName, TableSchema, TransitionError,
    classify_transition, render_catch_up_ddls,
};
