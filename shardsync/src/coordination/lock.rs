use std::cmp::Ordering;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use shardsync_mysql::{
    AlterOp, SchemaJoinError, TableName, TableSchema, classify_transition, render_catch_up_ddls,
};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::{bail, sync_error};
use crate::records::{ConflictStage, Info, Operation};
use crate::store::{KvStore, KvTxn, keys, optimism};

/// Builds the id of the lock coordinating one downstream table under a task.
///
/// The grammar is `<task>-` followed by the backtick-quoted downstream schema
/// and table; embedded backticks are doubled. Identical inputs produce the
/// identical id across master restarts.
pub fn lock_id(task: &str, down_schema: &str, down_table: &str) -> String {
    format!(
        "{task}-`{}`.`{}`",
        down_schema.replace('`', "``"),
        down_table.replace('`', "``")
    )
}

/// Identifies one upstream table's membership in a lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberKey {
    pub source: String,
    pub up_schema: String,
    pub up_table: String,
}

impl MemberKey {
    pub fn new(
        source: impl Into<String>,
        up_schema: impl Into<String>,
        up_table: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            up_schema: up_schema.into(),
            up_table: up_table.into(),
        }
    }

    pub fn from_info(info: &Info) -> Self {
        Self::new(&info.source, &info.up_schema, &info.up_table)
    }
}

/// Per-member state: the schema this upstream currently has and whether its
/// worker acknowledged the last decision.
#[derive(Debug, Clone)]
struct MemberState {
    current: TableSchema,
    done: bool,
    /// Bumped each time a proposal from this member is accepted.
    version: u64,
    /// The last accepted proposal and its decision, kept so a byte-identical
    /// retry returns the same answer without another KV write.
    last_decision: Option<LastDecision>,
}

#[derive(Debug, Clone)]
struct LastDecision {
    info: Info,
    ddls: Vec<String>,
    cols: Vec<String>,
}

/// The outcome of reconciling one proposal, computed before anything is
/// persisted or mutated.
#[derive(Debug)]
struct Decision {
    /// DDLs the calling source must execute downstream.
    ddls: Vec<String>,
    /// Columns newly entering the tracked (partially dropped) set.
    cols_added: Vec<String>,
    /// Columns leaving the tracked set (unanimous drop).
    cols_removed: Vec<String>,
    new_current: TableSchema,
    new_joined: TableSchema,
    stage: ConflictStage,
    conflict_msg: String,
    /// Parked peer proposals applied alongside this one (conflict resolution).
    resolved: Vec<Info>,
}

#[derive(Debug)]
struct LockInner {
    joined: TableSchema,
    /// The authoritative initial schema; late members start from here, never
    /// from the live joined schema.
    init_schema: TableSchema,
    members: BTreeMap<MemberKey, MemberState>,
    /// Columns some members dropped while others still reference them, in
    /// insertion order. A column leaves the set only on unanimous drop.
    tracked_columns: Vec<String>,
    /// Conflicting proposals parked until the peers converge, at most one per
    /// member.
    pending_infos: Vec<Info>,
}

impl LockInner {
    /// Joins `extra` with the current schemas of every member except `except`.
    fn lub_excluding(
        &self,
        except: &MemberKey,
        extra: &TableSchema,
    ) -> Result<TableSchema, SchemaJoinError> {
        let others = self
            .members
            .iter()
            .filter(|(key, _)| *key != except)
            .map(|(_, member)| &member.current);
        extra.join_all(others)
    }

    /// Attempts to join every member's prospective final schema: the parked
    /// proposal's final state when one exists, the current schema otherwise.
    ///
    /// A successful join means the conflicting proposals converged and can all
    /// be applied.
    fn pending_resolution(&self, pending: &[Info]) -> Option<TableSchema> {
        let mut finals: BTreeMap<MemberKey, TableSchema> = self
            .members
            .iter()
            .map(|(key, member)| (key.clone(), member.current.clone()))
            .collect();
        for info in pending {
            finals.insert(MemberKey::from_info(info), final_schema_of(info));
        }

        let mut iter = finals.into_values();
        let mut joined = iter.next()?;
        for schema in iter {
            joined = joined.join(&schema).ok()?;
        }
        Some(joined)
    }

    /// Reconciles one proposal against the joined schema, DDL by DDL.
    ///
    /// Pure with respect to `self`: all mutations are described by the
    /// returned [`Decision`] and applied only after successful persistence.
    fn compute_sync(&self, key: &MemberKey, info: &Info, lock_id: &str) -> SyncResult<Decision> {
        let member_current = self
            .members
            .get(key)
            .map(|m| m.current.clone())
            .unwrap_or_else(|| info.table_info_before.clone());

        let mut cur = member_current;
        let mut joined = self.joined.clone();
        let mut ddls = Vec::new();
        let mut cols_added: Vec<String> = Vec::new();
        let mut cols_removed: Vec<String> = Vec::new();

        for (ddl, post) in info.ddls.iter().zip(&info.table_infos_after) {
            let op = classify_transition(&cur, post).map_err(|e| {
                SyncError::with_source(
                    ErrorKind::UnsupportedDdl {
                        source: info.source.clone(),
                        ddl: ddl.clone(),
                    },
                    e,
                )
            })?;

            let prospective = self
                .lub_excluding(key, post)
                .map_err(|e| conflict_error(lock_id, info, &op, e))?;

            match &op {
                AlterOp::NoOp => {}
                AlterOp::DropColumn { name } => {
                    let referenced_elsewhere = self
                        .members
                        .iter()
                        .any(|(k, m)| k != key && m.current.has_column(name));
                    if referenced_elsewhere {
                        // Partial drop: keep the column readable downstream and
                        // track it until every member agrees.
                        if !self.tracked_columns.contains(name) && !cols_added.contains(name) {
                            cols_added.push(name.clone());
                        }
                    } else {
                        ddls.push(ddl.clone());
                        if self.tracked_columns.contains(name) || cols_added.contains(name) {
                            cols_removed.push(name.clone());
                            cols_added.retain(|c| c != name);
                        }
                    }
                }
                _ => {
                    // Emit when the joined schema grows, or when this member
                    // lags behind the joined schema and the statement is part
                    // of its catch-up.
                    let grew = !prospective.is_subset_of(&joined);
                    let catching_up = cur.compare(&joined) == Some(Ordering::Less);
                    if grew || catching_up {
                        ddls.push(ddl.clone());
                    }
                }
            }

            joined = prospective;
            cur = post.clone();
        }

        Ok(Decision {
            ddls,
            cols_added,
            cols_removed,
            new_current: cur,
            new_joined: joined,
            stage: ConflictStage::None,
            conflict_msg: String::new(),
            resolved: Vec::new(),
        })
    }
}

/// Maps a join failure to the conflict category the caller diagnoses by.
///
/// A failed join on the column the proposal itself added is an add-add
/// conflict; on any other column it is an incompatible type change.
fn conflict_error(lock_id: &str, info: &Info, op: &AlterOp, err: SchemaJoinError) -> SyncError {
    let kind = match (&err, op) {
        (
            SchemaJoinError::ColumnTypeConflict { column, left, right },
            AlterOp::AddColumn { name },
        ) if name == column => ErrorKind::ColumnConflict {
            lock_id: lock_id.to_string(),
            source: info.source.clone(),
            column: column.clone(),
            detail: format!("{left} vs {right}"),
        },
        (SchemaJoinError::ColumnTypeConflict { column, left, right }, _) => {
            ErrorKind::ColumnTypeConflict {
                lock_id: lock_id.to_string(),
                source: info.source.clone(),
                column: column.clone(),
                detail: format!("{left} vs {right}"),
            }
        }
        (SchemaJoinError::IndexConflict { index }, _) => ErrorKind::IndexConflict {
            lock_id: lock_id.to_string(),
            source: info.source.clone(),
            index: index.clone(),
        },
        (SchemaJoinError::CharsetConflict { left, right }, _) => ErrorKind::InvariantViolation {
            description: format!(
                "members of lock '{lock_id}' diverged in charset ({left} vs {right})"
            ),
        },
    };
    sync_error!(kind, err)
}

fn final_schema_of(info: &Info) -> TableSchema {
    info.table_infos_after
        .last()
        .cloned()
        .unwrap_or_else(|| info.table_info_before.clone())
}

/// The per-target-table state machine.
///
/// A [`Lock`] joins the schemas of every upstream table routed into one
/// downstream table, computes the DDLs each source must execute downstream to
/// reach the joined schema, and tracks per-member acknowledgement. It owns its
/// member state exclusively; the keeper shares the lock itself through an
/// [`std::sync::Arc`], so pointer identity is stable until removal.
///
/// All public operations are safe under concurrent callers: the inner mutex
/// is held across the persist step, which serializes concurrent `try_sync`
/// calls on the same lock and keeps the observed joined-schema sequence a
/// totally ordered chain.
#[derive(Debug)]
pub struct Lock {
    id: String,
    task: String,
    down_schema: String,
    down_table: String,
    inner: Mutex<LockInner>,
}

impl Lock {
    /// Creates a lock over `members`, all starting from the recorded initial
    /// schema.
    pub fn new(
        task: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        init_schema: TableSchema,
        members: Vec<MemberKey>,
    ) -> Self {
        let task = task.into();
        let down_schema = down_schema.into();
        let down_table = down_table.into();

        let members = members
            .into_iter()
            .map(|key| {
                (
                    key,
                    MemberState {
                        current: init_schema.clone(),
                        done: false,
                        version: 0,
                        last_decision: None,
                    },
                )
            })
            .collect();

        Self {
            id: lock_id(&task, &down_schema, &down_table),
            task,
            down_schema,
            down_table,
            inner: Mutex::new(LockInner {
                joined: init_schema.clone(),
                init_schema,
                members,
                tracked_columns: Vec::new(),
                pending_infos: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn down_schema(&self) -> &str {
        &self.down_schema
    }

    pub fn down_table(&self) -> &str {
        &self.down_table
    }

    /// Reconciles one proposal and returns `(ddls, cols)`: the DDLs the
    /// calling source must execute downstream and the columns newly added to
    /// the tracked-column set.
    ///
    /// The proposal and the answering [`Operation`] are persisted in one
    /// transaction before any in-memory state changes; a failed or cancelled
    /// persist leaves the lock untouched. Conflicts surface as errors after a
    /// stage-`detected` operation was recorded for the worker.
    pub async fn try_sync<S: KvStore>(
        &self,
        kv: &S,
        info: &Info,
    ) -> SyncResult<(Vec<String>, Vec<String>)> {
        if info.ddls.len() != info.table_infos_after.len() {
            return Err(SyncError::info_malformed(format!(
                "{} ddls described by {} post-states",
                info.ddls.len(),
                info.table_infos_after.len()
            )));
        }

        let key = MemberKey::from_info(info);
        let mut inner = self.inner.lock().await;

        if let Some(member) = inner.members.get(&key)
            && let Some(last) = &member.last_decision
            && last.info == *info
        {
            debug!(lock_id = %self.id, source = %info.source, "identical proposal retried, returning recorded decision");
            return Ok((last.ddls.clone(), last.cols.clone()));
        }

        match inner.compute_sync(&key, info, &self.id) {
            Ok(decision) => {
                let (ddls, cols) = self
                    .persist_and_apply(kv, &mut inner, &key, info, decision)
                    .await?;
                debug!(
                    lock_id = %self.id,
                    source = %info.source,
                    ddls = ?ddls,
                    "proposal reconciled"
                );
                Ok((ddls, cols))
            }
            Err(err) if err.is_conflict() => {
                self.handle_conflict(kv, &mut inner, &key, info, err).await
            }
            Err(err) => Err(err),
        }
    }

    /// Conflict path: downgrade on request, resolve when the parked proposals
    /// converge, otherwise park and surface the error.
    async fn handle_conflict<S: KvStore>(
        &self,
        kv: &S,
        inner: &mut LockInner,
        key: &MemberKey,
        info: &Info,
        err: SyncError,
    ) -> SyncResult<(Vec<String>, Vec<String>)> {
        if info.ignore_conflict {
            warn!(
                lock_id = %self.id,
                source = %info.source,
                error = %err,
                "ignoring schema conflict on request, keeping the first observed definition"
            );
            let decision = Decision {
                ddls: Vec::new(),
                cols_added: Vec::new(),
                cols_removed: Vec::new(),
                new_current: inner.joined.clone(),
                new_joined: inner.joined.clone(),
                stage: ConflictStage::Skipped,
                conflict_msg: err.to_string(),
                resolved: Vec::new(),
            };
            return self.persist_and_apply(kv, inner, key, info, decision).await;
        }

        let mut candidate: Vec<Info> = inner
            .pending_infos
            .iter()
            .filter(|p| MemberKey::from_info(p) != *key)
            .cloned()
            .collect();
        candidate.push(info.clone());

        if let Some(new_joined) = inner.pending_resolution(&candidate) {
            debug!(lock_id = %self.id, "conflict resolved by converging proposals");
            let decision = Decision {
                ddls: info.ddls.clone(),
                cols_added: Vec::new(),
                cols_removed: Vec::new(),
                new_current: final_schema_of(info),
                new_joined,
                stage: ConflictStage::Resolved,
                conflict_msg: String::new(),
                resolved: candidate
                    .iter()
                    .filter(|p| MemberKey::from_info(p) != *key)
                    .cloned()
                    .collect(),
            };
            return self.persist_and_apply(kv, inner, key, info, decision).await;
        }

        // Unresolved: record the proposal and a detected operation so the
        // worker holds, then surface the conflict.
        let operation = Operation::new(
            info,
            Vec::new(),
            Vec::new(),
            ConflictStage::Detected,
            err.to_string(),
        );
        let txn = KvTxn::new()
            .put(
                keys::info_key(&info.task, &info.source, &info.up_schema, &info.up_table),
                optimism::encode(info)?,
            )
            .put(
                keys::operation_key(&info.task, &info.source, &info.up_schema, &info.up_table),
                optimism::encode(&operation)?,
            );
        let outcome = kv.txn(txn).await?;
        if !outcome.succeeded {
            bail!(ErrorKind::KvTxnFailed);
        }

        inner.pending_infos = candidate;
        warn!(lock_id = %self.id, source = %info.source, error = %err, "schema conflict detected");
        Err(err)
    }

    /// Persists the decision (proposal, operations, tracked-column records) in
    /// one transaction, then applies it to the in-memory state.
    async fn persist_and_apply<S: KvStore>(
        &self,
        kv: &S,
        inner: &mut LockInner,
        key: &MemberKey,
        info: &Info,
        decision: Decision,
    ) -> SyncResult<(Vec<String>, Vec<String>)> {
        let operation = Operation::new(
            info,
            decision.ddls.clone(),
            decision.cols_added.clone(),
            decision.stage,
            decision.conflict_msg.clone(),
        );

        let mut txn = KvTxn::new()
            .put(
                keys::info_key(&info.task, &info.source, &info.up_schema, &info.up_table),
                optimism::encode(info)?,
            )
            .put(
                keys::operation_key(&info.task, &info.source, &info.up_schema, &info.up_table),
                optimism::encode(&operation)?,
            );
        for peer in &decision.resolved {
            let peer_operation = Operation::new(
                peer,
                peer.ddls.clone(),
                Vec::new(),
                ConflictStage::Resolved,
                "",
            );
            txn = txn
                .put(
                    keys::info_key(&peer.task, &peer.source, &peer.up_schema, &peer.up_table),
                    optimism::encode(peer)?,
                )
                .put(
                    keys::operation_key(&peer.task, &peer.source, &peer.up_schema, &peer.up_table),
                    optimism::encode(&peer_operation)?,
                );
        }
        for col in &decision.cols_added {
            txn = txn.put(
                keys::column_key(&self.task, &self.down_schema, &self.down_table, col),
                col.clone(),
            );
        }
        for col in &decision.cols_removed {
            txn = txn.delete(keys::column_key(
                &self.task,
                &self.down_schema,
                &self.down_table,
                col,
            ));
        }

        let outcome = kv.txn(txn).await?;
        if !outcome.succeeded {
            bail!(ErrorKind::KvTxnFailed);
        }

        // Persistence succeeded; the in-memory state may now change.
        let member = inner.members.entry(key.clone()).or_insert(MemberState {
            current: decision.new_current.clone(),
            done: false,
            version: 0,
            last_decision: None,
        });
        member.current = decision.new_current;
        member.done = false;
        member.version += 1;
        member.last_decision = Some(LastDecision {
            info: info.clone(),
            ddls: decision.ddls.clone(),
            cols: decision.cols_added.clone(),
        });

        for peer in &decision.resolved {
            let peer_key = MemberKey::from_info(peer);
            let current = final_schema_of(peer);
            let member = inner.members.entry(peer_key).or_insert(MemberState {
                current: current.clone(),
                done: false,
                version: 0,
                last_decision: None,
            });
            member.current = current;
            member.done = false;
            member.version += 1;
            member.last_decision = Some(LastDecision {
                info: peer.clone(),
                ddls: peer.ddls.clone(),
                cols: Vec::new(),
            });
        }

        inner.joined = decision.new_joined;
        for col in decision.cols_added.iter() {
            if !inner.tracked_columns.contains(col) {
                inner.tracked_columns.push(col.clone());
            }
        }
        inner
            .tracked_columns
            .retain(|c| !decision.cols_removed.contains(c));

        if decision.stage == ConflictStage::Resolved {
            inner.pending_infos.clear();
        } else {
            inner.pending_infos.retain(|p| MemberKey::from_info(p) != *key);
        }

        Ok((decision.ddls, decision.cols_added))
    }

    /// Marks the member's last decision as executed downstream.
    ///
    /// Returns true iff the flag flipped; `done` only moves false to true
    /// here, a new proposal for the member resets it.
    pub async fn mark_done(&self, source: &str, up_schema: &str, up_table: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner
            .members
            .get_mut(&MemberKey::new(source, up_schema, up_table))
        {
            Some(member) if !member.done => {
                member.done = true;
                true
            }
            _ => false,
        }
    }

    /// Returns `(synced, remain)`: whether every member reached the joined
    /// schema with no conflict parked, and how many members have not.
    pub async fn is_synced(&self) -> (bool, usize) {
        let inner = self.inner.lock().await;
        let remain = inner
            .members
            .values()
            .filter(|m| m.current.compare(&inner.joined) != Some(Ordering::Equal))
            .count();
        (remain == 0 && inner.pending_infos.is_empty(), remain)
    }

    /// Returns whether the lock is finished and eligible for removal: synced,
    /// every member acknowledged, and no column awaiting unanimous drop.
    pub async fn is_resolved(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.pending_infos.is_empty()
            && inner.tracked_columns.is_empty()
            && inner.members.values().all(|m| {
                m.done && m.current.compare(&inner.joined) == Some(Ordering::Equal)
            })
    }

    /// Adds a member joining mid-lock.
    ///
    /// The new member starts from the recorded initial schema (never the live
    /// joined schema, which the downstream may not have been told about in
    /// full) and receives the catch-up DDLs that bridge it to the joined
    /// schema. Returns `None` when the member already exists.
    pub async fn add_table(&self, key: MemberKey) -> SyncResult<Option<Vec<String>>> {
        let mut inner = self.inner.lock().await;
        if inner.members.contains_key(&key) {
            return Ok(None);
        }

        let current = inner.init_schema.clone();
        let new_joined = inner.joined.join(&current).map_err(|e| {
            SyncError::with_source(
                ErrorKind::InvariantViolation {
                    description: format!(
                        "init schema of lock '{}' no longer joins with its members",
                        self.id
                    ),
                },
                e,
            )
        })?;
        let ddls = render_catch_up_ddls(
            &TableName::new(&*self.down_schema, &*self.down_table),
            &current,
            &new_joined,
        );

        debug!(lock_id = %self.id, source = %key.source, up_schema = %key.up_schema, up_table = %key.up_table, "member joined mid-lock");
        inner.members.insert(
            key,
            MemberState {
                current,
                done: false,
                version: 0,
                last_decision: None,
            },
        );
        inner.joined = new_joined;
        Ok(Some(ddls))
    }

    /// Removes a member mid-lock, recomputing the joined schema over the
    /// remaining members and releasing tracked columns nobody references
    /// anymore. Returns true iff the member existed.
    pub async fn remove_table(&self, key: &MemberKey) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.members.remove(key).is_none() {
            return false;
        }
        inner.pending_infos.retain(|p| MemberKey::from_info(p) != *key);

        let mut remaining = inner.members.values().map(|m| &m.current);
        let joined = match remaining.next() {
            Some(first) => match first.join_all(remaining) {
                Ok(joined) => joined,
                // Members were pairwise joinable before the removal; keep the
                // old joined schema rather than poison the lock.
                Err(_) => inner.joined.clone(),
            },
            None => inner.init_schema.clone(),
        };

        inner.joined = joined;
        let joined = inner.joined.clone();
        inner.tracked_columns.retain(|c| joined.has_column(c));

        debug!(lock_id = %self.id, source = %key.source, up_schema = %key.up_schema, up_table = %key.up_table, "member removed mid-lock");
        true
    }

    /// Returns the current joined schema.
    pub async fn joined(&self) -> TableSchema {
        self.inner.lock().await.joined.clone()
    }

    /// Returns the member keys, in deterministic order.
    pub async fn members(&self) -> Vec<MemberKey> {
        self.inner.lock().await.members.keys().cloned().collect()
    }

    /// Returns whether the given member is part of this lock.
    pub async fn has_member(&self, key: &MemberKey) -> bool {
        self.inner.lock().await.members.contains_key(key)
    }

    /// Returns the tracked (partially dropped) columns in insertion order.
    pub async fn tracked_columns(&self) -> Vec<String> {
        self.inner.lock().await.tracked_columns.clone()
    }

    /// Returns every member lagging behind the joined schema together with its
    /// catch-up DDLs. Used by the force-release path.
    pub async fn lagging_members(&self) -> Vec<(MemberKey, Vec<String>)> {
        let inner = self.inner.lock().await;
        let table = TableName::new(&*self.down_schema, &*self.down_table);
        inner
            .members
            .iter()
            .filter(|(_, m)| m.current.compare(&inner.joined) != Some(Ordering::Equal))
            .map(|(key, m)| {
                (
                    key.clone(),
                    render_catch_up_ddls(&table, &m.current, &inner.joined),
                )
            })
            .collect()
    }
}
