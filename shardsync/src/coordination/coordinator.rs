use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::concurrency::ShutdownRx;
use crate::coordination::lock::{Lock, MemberKey, lock_id};
use crate::coordination::lock_keeper::{DownstreamMeta, DownstreamMetaResolver, LockKeeper};
use crate::coordination::table_keeper::{SourceTables, SourceTablesMap, TableKeeper, TableRoute};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::records::{ConflictStage, Info, Operation};
use crate::store::{KvStore, KvTxn, WatchEvent, keys, optimism};

/// The call site external subsystems use.
///
/// Source workers publish proposals through [`Coordinator::submit_info`] and
/// receive back the [`Operation`] they must execute downstream; binlog readers
/// report routing changes through [`Coordinator::report_source_tables`]; the
/// watch loop ([`Coordinator::run`]) consumes proposals and acknowledgements
/// written directly to the KV store by remote workers. A newly elected master
/// calls [`Coordinator::rebuild`] before serving.
pub struct Coordinator<S> {
    kv: S,
    table_keeper: TableKeeper,
    lock_keeper: Arc<LockKeeper>,
}

impl<S: KvStore> Coordinator<S> {
    pub fn new(kv: S, get_downstream_meta: DownstreamMetaResolver) -> Self {
        Self {
            kv,
            table_keeper: TableKeeper::new(),
            lock_keeper: Arc::new(LockKeeper::new(get_downstream_meta)),
        }
    }

    /// Returns the membership index.
    pub fn table_keeper(&self) -> &TableKeeper {
        &self.table_keeper
    }

    /// Returns the lock registry.
    pub fn lock_keeper(&self) -> &Arc<LockKeeper> {
        &self.lock_keeper
    }

    /// Seeds the membership index, usually from the task configuration.
    pub async fn init_membership(&self, snapshot: Option<SourceTablesMap>) {
        self.table_keeper.init(snapshot).await;
    }

    /// Submits one proposal and returns the persisted decision the calling
    /// worker must consume.
    pub async fn submit_info(&self, info: Info) -> SyncResult<Operation> {
        let tts = self
            .table_keeper
            .find_tables(&info.task, &info.down_schema, &info.down_table)
            .await;

        let (id, _, _) = self
            .lock_keeper
            .try_sync(&self.kv, info.clone(), &tts)
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(task = %info.task, source = %info.source, error = %e, "proposal conflicted");
                }
            })?;

        let operation =
            optimism::get_operation(&self.kv, &info.task, &info.source, &info.up_schema, &info.up_table)
                .await?
                .ok_or_else(|| {
                    SyncError::invariant(format!(
                        "operation vanished right after try_sync of lock '{id}'"
                    ))
                })?;
        Ok(operation)
    }

    /// Merges one source's routing record and propagates the deltas into the
    /// live locks: new routes join their lock (receiving catch-up operations),
    /// dropped routes leave it, and a lock whose last member left is removed.
    pub async fn report_source_tables(
        &self,
        st: SourceTables,
    ) -> SyncResult<(Vec<TableRoute>, Vec<TableRoute>)> {
        let task = st.task.clone();
        let source = st.source.clone();
        let (added, dropped) = self.table_keeper.update(st).await;

        for route in &added {
            let id = lock_id(&task, &route.down_schema, &route.down_table);
            let Some(lock) = self.lock_keeper.find_lock(&id).await else {
                continue;
            };

            let key = MemberKey::new(&source, &route.up_schema, &route.up_table);
            if let Some(ddls) = lock.add_table(key).await? {
                // Hand the late member its catch-up work through a regular
                // operation record.
                let operation = Operation {
                    task: task.clone(),
                    source: source.clone(),
                    up_schema: route.up_schema.clone(),
                    up_table: route.up_table.clone(),
                    ddls,
                    conflict_stage: ConflictStage::None,
                    conflict_msg: String::new(),
                    cols: Vec::new(),
                    done: false,
                    revision: 0,
                };
                optimism::put_operation(&self.kv, &operation).await?;
            }
        }

        for route in &dropped {
            let id = lock_id(&task, &route.down_schema, &route.down_table);
            let Some(lock) = self.lock_keeper.find_lock(&id).await else {
                continue;
            };

            let key = MemberKey::new(&source, &route.up_schema, &route.up_table);
            if lock.remove_table(&key).await {
                let txn = KvTxn::new()
                    .delete(keys::info_key(&task, &key.source, &key.up_schema, &key.up_table))
                    .delete(keys::operation_key(&task, &key.source, &key.up_schema, &key.up_table));
                let outcome = self.kv.txn(txn).await?;
                if !outcome.succeeded {
                    return Err(SyncError::new(ErrorKind::KvTxnFailed));
                }
            }
            if lock.members().await.is_empty() {
                self.remove_lock(&lock).await?;
            }
        }

        Ok((added, dropped))
    }

    /// Acknowledges a decision: the worker applied its DDLs downstream.
    ///
    /// Returns true iff the flag flipped. A lock whose members all
    /// acknowledged (and whose tracked-column set drained) is removed together
    /// with its KV records.
    pub async fn mark_done(
        &self,
        task: &str,
        down_schema: &str,
        down_table: &str,
        source: &str,
        up_schema: &str,
        up_table: &str,
    ) -> SyncResult<bool> {
        let id = lock_id(task, down_schema, down_table);
        let Some(lock) = self.lock_keeper.find_lock(&id).await else {
            return Ok(false);
        };

        let changed = lock.mark_done(source, up_schema, up_table).await;
        if changed
            && let Some(mut operation) =
                optimism::get_operation(&self.kv, task, source, up_schema, up_table).await?
            && !operation.done
        {
            operation.done = true;
            optimism::put_operation(&self.kv, &operation).await?;
        }

        if lock.is_resolved().await {
            info!(lock_id = %id, "lock synced and acknowledged by all members");
            self.remove_lock(&lock).await?;
        }
        Ok(changed)
    }

    /// Force-releases a lock: every lagging member receives a stage-`unlock`
    /// operation carrying its catch-up DDLs, then the lock is dropped.
    ///
    /// Maintenance escape hatch for operators; the normal path is unanimous
    /// acknowledgement.
    pub async fn unlock(&self, task: &str, down_schema: &str, down_table: &str) -> SyncResult<()> {
        let id = lock_id(task, down_schema, down_table);
        let Some(lock) = self.lock_keeper.find_lock(&id).await else {
            return Err(SyncError::new(ErrorKind::LockNotFound { lock_id: id }));
        };

        let lagging = lock.lagging_members().await;
        // Cleanup first: the release operations must outlive the removal of
        // the lock's own records.
        self.remove_lock(&lock).await?;

        for (key, ddls) in lagging {
            let operation = Operation {
                task: task.to_string(),
                source: key.source.clone(),
                up_schema: key.up_schema.clone(),
                up_table: key.up_table.clone(),
                ddls,
                conflict_stage: ConflictStage::Unlock,
                conflict_msg: String::new(),
                cols: Vec::new(),
                done: false,
                revision: 0,
            };
            optimism::put_operation(&self.kv, &operation).await?;
        }

        warn!(lock_id = %id, "lock force-released");
        Ok(())
    }

    /// Rebuilds the in-memory lock state after master failover.
    ///
    /// Reads everything persisted under `task` in one consistent snapshot,
    /// replays the proposals in commit-revision order, then re-applies the
    /// recorded acknowledgements. Conflicts replay as conflicts and stay
    /// parked, exactly as they were on the previous master. Returns the
    /// snapshot revision to resume watches from.
    pub async fn rebuild(&self, task: &str) -> SyncResult<i64> {
        let snapshot = optimism::load_task_snapshot(&self.kv, task).await?;

        for (info, _) in &snapshot.infos {
            let tts = self
                .table_keeper
                .find_tables(&info.task, &info.down_schema, &info.down_table)
                .await;
            if let Err(e) = self.lock_keeper.try_sync(&self.kv, info.clone(), &tts).await {
                if e.is_conflict() {
                    debug!(task, source = %info.source, error = %e, "replayed proposal still conflicts");
                } else {
                    return Err(e);
                }
            }
        }

        for operation in &snapshot.operations {
            if !operation.done {
                continue;
            }
            let id = lock_id_of_operation(&self.kv, operation).await?;
            if let Some(id) = id
                && let Some(lock) = self.lock_keeper.find_lock(&id).await
            {
                lock.mark_done(&operation.source, &operation.up_schema, &operation.up_table)
                    .await;
                // Replaying the proposal rewrote the operation record with a
                // fresh (not yet done) decision; restore the acknowledged one.
                optimism::put_operation(&self.kv, operation).await?;
            }
        }

        info!(
            task,
            locks = self.lock_keeper.find_locks_by_task(task).await.len(),
            "rebuilt shard-DDL state from snapshot"
        );
        Ok(snapshot.revision)
    }

    /// Watch loop: consumes proposals and acknowledgements written to the KV
    /// store by remote workers, from `from_revision` until shutdown.
    pub async fn run(&self, from_revision: i64, mut shutdown: ShutdownRx) -> SyncResult<()> {
        let mut info_watch = self
            .kv
            .watch_prefix(keys::INFO_PREFIX, from_revision)
            .await?;
        let mut operation_watch = self
            .kv
            .watch_prefix(keys::OPERATION_PREFIX, from_revision)
            .await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shard-DDL coordinator stopped");
                    return Ok(());
                }
                event = info_watch.recv() => {
                    let Some(event) = event else { return Ok(()); };
                    if let WatchEvent::Put(entry) = event
                        && let Err(e) = self.handle_info_put(&entry.value).await
                        && !e.is_conflict()
                    {
                        error!(error = %e, key = %entry.key, "failed to handle proposal");
                    }
                }
                event = operation_watch.recv() => {
                    let Some(event) = event else { return Ok(()); };
                    if let WatchEvent::Put(entry) = event
                        && let Err(e) = self.handle_operation_put(&entry.value).await
                    {
                        error!(error = %e, key = %entry.key, "failed to handle acknowledgement");
                    }
                }
            }
        }
    }

    async fn handle_info_put(&self, value: &str) -> SyncResult<()> {
        let info: Info = optimism::decode(value)?;
        let tts = self
            .table_keeper
            .find_tables(&info.task, &info.down_schema, &info.down_table)
            .await;
        self.lock_keeper.try_sync(&self.kv, info, &tts).await?;
        Ok(())
    }

    async fn handle_operation_put(&self, value: &str) -> SyncResult<()> {
        let operation: Operation = optimism::decode(value)?;
        if !operation.done {
            return Ok(());
        }

        if let Some(id) = lock_id_of_operation(&self.kv, &operation).await?
            && let Some(lock) = self.lock_keeper.find_lock(&id).await
        {
            lock.mark_done(&operation.source, &operation.up_schema, &operation.up_table)
                .await;
            if lock.is_resolved().await {
                info!(lock_id = %id, "lock synced and acknowledged by all members");
                self.remove_lock(&lock).await?;
            }
        }
        Ok(())
    }

    /// Drops a lock and every KV record belonging to it.
    async fn remove_lock(&self, lock: &Arc<Lock>) -> SyncResult<()> {
        let task = lock.task();
        let down_schema = lock.down_schema();
        let down_table = lock.down_table();

        let mut txn = KvTxn::new().delete(keys::init_schema_key(task, down_schema, down_table));
        for key in lock.members().await {
            txn = txn
                .delete(keys::info_key(task, &key.source, &key.up_schema, &key.up_table))
                .delete(keys::operation_key(task, &key.source, &key.up_schema, &key.up_table));
        }
        for column in lock.tracked_columns().await {
            txn = txn.delete(keys::column_key(task, down_schema, down_table, &column));
        }

        let outcome = self.kv.txn(txn).await?;
        if !outcome.succeeded {
            return Err(SyncError::new(ErrorKind::KvTxnFailed));
        }

        self.lock_keeper.remove_lock(lock.id()).await;
        Ok(())
    }

    /// Returns the downstream metadata of `task`, resolving it on first use.
    pub async fn downstream_meta(&self, task: &str) -> SyncResult<Arc<DownstreamMeta>> {
        self.lock_keeper.get_downstream_meta(task).await
    }
}

/// Recovers the lock id an operation belongs to.
///
/// Operations do not carry the downstream table; it comes from the proposal
/// stored under the same member key.
async fn lock_id_of_operation<S: KvStore>(
    kv: &S,
    operation: &Operation,
) -> SyncResult<Option<String>> {
    let info = optimism::get_info(
        kv,
        &operation.task,
        &operation.source,
        &operation.up_schema,
        &operation.up_table,
    )
    .await?;
    Ok(info.map(|i| lock_id(&i.task, &i.down_schema, &i.down_table)))
}
