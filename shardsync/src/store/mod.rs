//! KV-store binding.
//!
//! The coordinator persists every proposal and decision through an abstract
//! consistent KV store ([`KvStore`]) so that any master can rebuild its
//! in-memory state after failover. [`memory::MemoryKvStore`] is the in-process
//! implementation used by tests; production deployments bind the same trait to
//! their consistent store.

pub mod base;
pub mod keys;
pub mod memory;
pub mod optimism;

pub use base::{
    KvCompare, KvEntry, KvOp, KvStore, KvTxn, KvTxnOutcome, Revision, WatchEvent, WatchStream,
};
pub use memory::MemoryKvStore;
