use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use crate::error::SyncResult;
use crate::store::base::{
    KvCompare, KvEntry, KvOp, KvStore, KvTxn, KvTxnOutcome, Revision, WatchEvent, WatchStream,
};

/// A registered prefix watcher.
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Inner state of [`MemoryKvStore`].
struct Inner {
    /// Live entries, keyed by full key.
    entries: BTreeMap<String, KvEntry>,
    /// The current store revision; bumped once per committed mutation batch.
    revision: Revision,
    /// Every committed change, kept so watches can resume from a revision.
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl Inner {
    /// Applies one batch of ops at a single new revision and notifies watchers.
    fn commit(&mut self, ops: Vec<KvOp>) -> Revision {
        self.revision += 1;
        let revision = self.revision;

        for op in ops {
            let event = match op {
                KvOp::Put { key, value } => {
                    let entry = KvEntry {
                        key: key.clone(),
                        value,
                        mod_revision: revision,
                    };
                    self.entries.insert(key, entry.clone());
                    WatchEvent::Put(entry)
                }
                KvOp::Delete { key } => {
                    self.entries.remove(&key);
                    WatchEvent::Delete { key, revision }
                }
            };
            self.history.push(event.clone());
            self.notify(&event);
        }

        revision
    }

    fn notify(&mut self, event: &WatchEvent) {
        let key = match event {
            WatchEvent::Put(entry) => &entry.key,
            WatchEvent::Delete { key, .. } => key,
        };
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn check(&self, compare: &KvCompare) -> bool {
        match compare {
            KvCompare::KeyAbsent { key } => !self.entries.contains_key(key),
            KvCompare::ModRevisionEquals { key, revision } => self
                .entries
                .get(key)
                .is_some_and(|e| e.mod_revision == *revision),
        }
    }
}

/// In-memory revisioned KV store.
///
/// [`MemoryKvStore`] implements the full [`KvStore`] contract (single-revision
/// transactional commits, consistent prefix scans, resumable prefix watches)
/// over a mutex-guarded map. It backs the test suite and any single-process
/// deployment; clustered deployments bind [`KvStore`] to their consistent
/// store instead.
///
/// The store keeps its full change history for watch resumption and is
/// therefore unsuitable for unbounded production workloads.
#[derive(Clone)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKvStore {
    /// Creates a new empty store at revision zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                revision: 0,
                history: Vec::new(),
                watchers: Vec::new(),
            })),
        }
    }

    /// Returns the current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> SyncResult<Option<KvEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> SyncResult<Revision> {
        let mut inner = self.inner.lock().await;
        Ok(inner.commit(vec![KvOp::Put {
            key: key.to_string(),
            value: value.to_string(),
        }]))
    }

    async fn delete(&self, key: &str) -> SyncResult<Revision> {
        let mut inner = self.inner.lock().await;
        Ok(inner.commit(vec![KvOp::Delete {
            key: key.to_string(),
        }]))
    }

    async fn scan_prefix(&self, prefix: &str) -> SyncResult<(Vec<KvEntry>, Revision)> {
        let inner = self.inner.lock().await;
        let entries = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect();
        Ok((entries, inner.revision))
    }

    async fn txn(&self, txn: KvTxn) -> SyncResult<KvTxnOutcome> {
        let mut inner = self.inner.lock().await;

        if !txn.compares.iter().all(|c| inner.check(c)) {
            return Ok(KvTxnOutcome {
                succeeded: false,
                revision: inner.revision,
            });
        }

        let revision = inner.commit(txn.ops);
        Ok(KvTxnOutcome {
            succeeded: true,
            revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> SyncResult<WatchStream> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay history after the resume point before going live; the mutex
        // is held throughout, so no committed change can be missed or reordered.
        for event in &inner.history {
            let (key, revision) = match event {
                WatchEvent::Put(entry) => (&entry.key, entry.mod_revision),
                WatchEvent::Delete { key, revision } => (key, *revision),
            };
            if revision > from_revision && key.starts_with(prefix) {
                let _ = tx.send(event.clone());
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = MemoryKvStore::new();

        let rev1 = kv.put("a/b", "1").await.unwrap();
        let entry = kv.get("a/b").await.unwrap().unwrap();
        assert_eq!(entry.value, "1");
        assert_eq!(entry.mod_revision, rev1);

        let rev2 = kv.delete("a/b").await.unwrap();
        assert!(rev2 > rev1);
        assert!(kv.get("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_prefix_returns_only_matching_entries() {
        let kv = MemoryKvStore::new();
        kv.put("a/1", "x").await.unwrap();
        kv.put("a/2", "y").await.unwrap();
        kv.put("b/1", "z").await.unwrap();

        let (entries, revision) = kv.scan_prefix("a/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(revision, 3);
    }

    #[tokio::test]
    async fn txn_applies_all_ops_at_one_revision() {
        let kv = MemoryKvStore::new();
        let outcome = kv
            .txn(KvTxn::new().put("a", "1").put("b", "2"))
            .await
            .unwrap();
        assert!(outcome.succeeded);

        let a = kv.get("a").await.unwrap().unwrap();
        let b = kv.get("b").await.unwrap().unwrap();
        assert_eq!(a.mod_revision, outcome.revision);
        assert_eq!(b.mod_revision, outcome.revision);
    }

    #[tokio::test]
    async fn txn_guards_reject_stale_commits() {
        let kv = MemoryKvStore::new();
        kv.put("a", "1").await.unwrap();

        let outcome = kv
            .txn(
                KvTxn::new()
                    .when(KvCompare::KeyAbsent {
                        key: "a".to_string(),
                    })
                    .put("a", "2"),
            )
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, "1");
    }

    #[tokio::test]
    async fn txn_commits_only_against_an_unchanged_revision() {
        let kv = MemoryKvStore::new();
        let rev = kv.put("a", "1").await.unwrap();

        // A stale writer loses once the key moved on.
        kv.put("a", "2").await.unwrap();
        let outcome = kv
            .txn(
                KvTxn::new()
                    .when(KvCompare::ModRevisionEquals {
                        key: "a".to_string(),
                        revision: rev,
                    })
                    .put("a", "stale"),
            )
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, "2");

        // The current revision commits.
        let current = kv.get("a").await.unwrap().unwrap().mod_revision;
        let outcome = kv
            .txn(
                KvTxn::new()
                    .when(KvCompare::ModRevisionEquals {
                        key: "a".to_string(),
                        revision: current,
                    })
                    .put("a", "3"),
            )
            .await
            .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(kv.get("a").await.unwrap().unwrap().value, "3");
    }

    #[tokio::test]
    async fn watch_replays_history_and_streams_live_changes() {
        let kv = MemoryKvStore::new();
        let rev1 = kv.put("w/1", "old").await.unwrap();

        let mut watch = kv.watch_prefix("w/", 0).await.unwrap();
        let replayed = watch.recv().await.unwrap();
        assert!(matches!(replayed, WatchEvent::Put(ref e) if e.value == "old"));

        kv.put("w/2", "new").await.unwrap();
        kv.put("other", "ignored").await.unwrap();
        let live = watch.recv().await.unwrap();
        assert!(matches!(live, WatchEvent::Put(ref e) if e.key == "w/2"));

        // Resuming from rev1 skips the first put.
        let mut resumed = kv.watch_prefix("w/", rev1).await.unwrap();
        let event = resumed.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Put(ref e) if e.key == "w/2"));
    }
}
