use std::future::Future;
use tokio::sync::mpsc;

use crate::error::SyncResult;

/// A store revision. Monotonically increasing across all mutations.
pub type Revision = i64;

/// A key-value entry together with the revision of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub mod_revision: Revision,
}

/// A single mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: String },
    Delete { key: String },
}

/// A guard a transaction is conditioned on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCompare {
    /// The key must be absent.
    KeyAbsent { key: String },
    /// The key's last modification revision must equal `revision`.
    ModRevisionEquals { key: String, revision: Revision },
}

/// A multi-key commit-if-unchanged transaction.
///
/// All compares are evaluated against one consistent snapshot; when every
/// guard holds, all ops are applied atomically at a single new revision.
#[derive(Debug, Clone, Default)]
pub struct KvTxn {
    pub compares: Vec<KvCompare>,
    pub ops: Vec<KvOp>,
}

impl KvTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: KvCompare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(KvOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(KvOp::Delete { key: key.into() });
        self
    }
}

/// The result of committing a [`KvTxn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvTxnOutcome {
    /// Whether every guard held and the ops were applied.
    pub succeeded: bool,
    /// The revision at which the ops were applied (or the snapshot revision
    /// when the guards failed).
    pub revision: Revision,
}

/// A change observed through a prefix watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KvEntry),
    Delete { key: String, revision: Revision },
}

/// The receiving half of a prefix watch.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Trait for the consistent KV store the coordinator persists through.
///
/// Implementations must ensure that `scan_prefix` observes one consistent
/// snapshot, that `txn` is atomic, and that a watch started from revision `r`
/// delivers every later change under its prefix exactly once and in revision
/// order.
pub trait KvStore: Send + Sync {
    /// Reads a single key.
    fn get(&self, key: &str) -> impl Future<Output = SyncResult<Option<KvEntry>>> + Send;

    /// Writes a single key, returning the commit revision.
    fn put(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = SyncResult<Revision>> + Send;

    /// Deletes a single key, returning the commit revision. Deleting an absent
    /// key still advances and returns the store revision.
    fn delete(&self, key: &str) -> impl Future<Output = SyncResult<Revision>> + Send;

    /// Returns every entry under `prefix` together with the snapshot revision.
    fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = SyncResult<(Vec<KvEntry>, Revision)>> + Send;

    /// Commits a multi-key transaction.
    fn txn(&self, txn: KvTxn) -> impl Future<Output = SyncResult<KvTxnOutcome>> + Send;

    /// Watches `prefix` for changes after `from_revision`.
    ///
    /// Changes already committed with a revision greater than `from_revision`
    /// are replayed first, making the watch resumable across reconnects.
    fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: Revision,
    ) -> impl Future<Output = SyncResult<WatchStream>> + Send;
}
