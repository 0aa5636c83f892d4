//! Optimistic shard-DDL coordination for a multi-source replication task.
//!
//! Multiple upstream shards converge into one downstream table; when
//! schema-changing statements appear in the upstream binlogs, this crate
//! reconciles them so the downstream schema evolves exactly once. Source
//! workers publish proposals ([`records::Info`]), the coordinator joins them
//! against the schemas of every participating shard, and each worker receives
//! back the decision ([`records::Operation`]) it must apply downstream.

pub mod concurrency;
pub mod coordination;
pub mod error;
pub mod macros;
pub mod records;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
