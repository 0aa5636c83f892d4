use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use shardsync_config::shared::MySqlConnectionConfig;

use crate::coordination::lock::{Lock, MemberKey, lock_id};
use crate::coordination::table_keeper::TargetTable;
use crate::error::{SyncError, SyncResult};
use crate::records::{Info, InitSchema};
use crate::store::{KvStore, optimism};

/// Resolves the downstream database config and meta schema name of a task.
///
/// `(None, "")` means the task has no downstream registered and surfaces as
/// [`crate::error::ErrorKind::DownstreamMetaNotFound`]. The resolver may block;
/// callers racing it against shutdown use
/// [`crate::concurrency::until_shutdown`].
pub type DownstreamMetaResolver =
    Arc<dyn Fn(&str) -> (Option<MySqlConnectionConfig>, String) + Send + Sync>;

/// Cached downstream metadata of one task.
#[derive(Debug, Clone)]
pub struct DownstreamMeta {
    pub db_config: MySqlConnectionConfig,
    pub meta_schema: String,
}

#[derive(Default)]
struct LockKeeperInner {
    /// Live locks keyed by lock id.
    locks: HashMap<String, Arc<Lock>>,
    /// Lazily resolved downstream metadata keyed by task.
    downstream_metas: HashMap<String, Arc<DownstreamMeta>>,
}

/// Owns the live set of [`Lock`]s and routes incoming proposals to the right
/// one, creating it on first contact.
///
/// Locks are shared as [`Arc`]s: [`LockKeeper::find_lock`] returns the same
/// allocation across calls until [`LockKeeper::remove_lock`] or
/// [`LockKeeper::clear`]. The keeper's own mutex is never held while a lock's
/// mutex is acquired; the order is always keeper first, lock second.
pub struct LockKeeper {
    inner: Mutex<LockKeeperInner>,
    get_downstream_meta: DownstreamMetaResolver,
}

impl LockKeeper {
    pub fn new(get_downstream_meta: DownstreamMetaResolver) -> Self {
        Self {
            inner: Mutex::new(LockKeeperInner::default()),
            get_downstream_meta,
        }
    }

    /// The central entry point: routes `info` through the lock for its
    /// downstream table and returns `(lock_id, ddls, cols)`.
    ///
    /// When no lock exists yet, one is created with `info.table_info_before`
    /// as the initial joined schema (adopting a previously persisted
    /// init-schema record when present) and with membership taken from `tts`.
    /// Existing locks absorb any members `tts` added since creation.
    pub async fn try_sync<S: KvStore>(
        &self,
        kv: &S,
        info: Info,
        tts: &[TargetTable],
    ) -> SyncResult<(String, Vec<String>, Vec<String>)> {
        let id = lock_id(&info.task, &info.down_schema, &info.down_table);

        let existing = {
            let inner = self.inner.lock().await;
            inner.locks.get(&id).cloned()
        };

        let lock = match existing {
            Some(lock) => {
                // Membership may have grown since the lock was created.
                for key in member_keys(&info, tts) {
                    if !lock.has_member(&key).await {
                        lock.add_table(key).await?;
                    }
                }
                lock
            }
            None => {
                let init = optimism::ensure_init_schema(
                    kv,
                    &InitSchema::new(
                        &info.task,
                        &info.down_schema,
                        &info.down_table,
                        info.table_info_before.clone(),
                    ),
                )
                .await?;

                let lock = Arc::new(Lock::new(
                    &info.task,
                    &info.down_schema,
                    &info.down_table,
                    init.table_info,
                    member_keys(&info, tts),
                ));

                let mut inner = self.inner.lock().await;
                // A concurrent creator may have won the race; adopt its lock.
                inner
                    .locks
                    .entry(id.clone())
                    .or_insert_with(|| {
                        info!(lock_id = %id, "created shard-DDL lock");
                        lock
                    })
                    .clone()
            }
        };

        let (ddls, cols) = lock.try_sync(kv, &info).await?;
        Ok((id, ddls, cols))
    }

    /// Returns the lock under `id`, if any.
    pub async fn find_lock(&self, id: &str) -> Option<Arc<Lock>> {
        let inner = self.inner.lock().await;
        inner.locks.get(id).cloned()
    }

    /// Returns the lock a proposal routes to, if it exists.
    pub async fn find_lock_by_info(&self, info: &Info) -> Option<Arc<Lock>> {
        self.find_lock(&lock_id(&info.task, &info.down_schema, &info.down_table))
            .await
    }

    /// Returns every lock belonging to `task`.
    pub async fn find_locks_by_task(&self, task: &str) -> Vec<Arc<Lock>> {
        let inner = self.inner.lock().await;
        inner
            .locks
            .values()
            .filter(|lock| lock.task() == task)
            .cloned()
            .collect()
    }

    /// Returns a snapshot of all locks keyed by id.
    pub async fn locks(&self) -> HashMap<String, Arc<Lock>> {
        let inner = self.inner.lock().await;
        inner.locks.clone()
    }

    /// Removes the lock under `id`. Returns true iff it existed.
    pub async fn remove_lock(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.locks.remove(id).is_some();
        if removed {
            debug!(lock_id = %id, "removed shard-DDL lock");
        }
        removed
    }

    /// Drops all locks and the downstream-metadata cache.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.locks.clear();
        inner.downstream_metas.clear();
    }

    /// Returns the downstream metadata of `task`, resolving and caching it on
    /// first access.
    ///
    /// Consecutive successful calls return the same [`Arc`] until
    /// [`LockKeeper::remove_downstream_meta`] or [`LockKeeper::clear`] evicts
    /// the entry.
    pub async fn get_downstream_meta(&self, task: &str) -> SyncResult<Arc<DownstreamMeta>> {
        {
            let inner = self.inner.lock().await;
            if let Some(meta) = inner.downstream_metas.get(task) {
                return Ok(meta.clone());
            }
        }

        // The resolver may block; the keeper mutex is not held across it.
        let (db_config, meta_schema) = (self.get_downstream_meta)(task);
        let Some(db_config) = db_config else {
            return Err(SyncError::downstream_meta_not_found(task));
        };

        let meta = Arc::new(DownstreamMeta {
            db_config,
            meta_schema,
        });

        let mut inner = self.inner.lock().await;
        // First resolution wins so callers keep observing one identity.
        Ok(inner
            .downstream_metas
            .entry(task.to_string())
            .or_insert(meta)
            .clone())
    }

    /// Evicts the downstream metadata of `task`; unknown tasks are a no-op.
    pub async fn remove_downstream_meta(&self, task: &str) {
        let mut inner = self.inner.lock().await;
        inner.downstream_metas.remove(task);
    }

    /// Returns a snapshot of the downstream-metadata cache.
    pub async fn downstream_metas(&self) -> HashMap<String, Arc<DownstreamMeta>> {
        let inner = self.inner.lock().await;
        inner.downstream_metas.clone()
    }
}

/// Expands the membership a lock must wait for: every upstream table the
/// target tables route into the proposal's downstream table, plus the
/// proposer itself.
fn member_keys(info: &Info, tts: &[TargetTable]) -> Vec<MemberKey> {
    let mut keys = Vec::new();
    for tt in tts {
        if tt.task != info.task
            || tt.down_schema != info.down_schema
            || tt.down_table != info.down_table
        {
            continue;
        }
        for (up_schema, up_tables) in &tt.up_tables {
            for up_table in up_tables {
                keys.push(MemberKey::new(&tt.source, up_schema, up_table));
            }
        }
    }

    let own = MemberKey::from_info(info);
    if !keys.contains(&own) {
        keys.push(own);
    }
    keys
}
