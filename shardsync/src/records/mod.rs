//! Serializable coordination records.
//!
//! Three record kinds flow through the KV store: [`Info`] (a source's DDL
//! proposal), [`Operation`] (the coordinator's decision for that source) and
//! [`InitSchema`] (the authoritative initial schema of a downstream table,
//! recorded once so a reborn master rebuilds joined state deterministically).
//!
//! Field names are pinned with kebab-case renames; they are part of the wire
//! format and must stay stable across versions.

use serde::{Deserialize, Serialize};
use shardsync_mysql::TableSchema;

use crate::store::Revision;

/// A source worker's proposal: "executing `ddls` transformed this upstream
/// table from `table_info_before` through `table_infos_after`".
///
/// Immutable once submitted; there is exactly one in-flight [`Info`] per
/// upstream table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Info {
    pub task: String,
    pub source: String,
    pub up_schema: String,
    pub up_table: String,
    pub down_schema: String,
    pub down_table: String,
    /// The proposed DDL statements, in execution order.
    pub ddls: Vec<String>,
    /// The table schema before the first DDL.
    pub table_info_before: TableSchema,
    /// The per-DDL post-states; same length as `ddls`.
    pub table_infos_after: Vec<TableSchema>,
    /// When set, a column conflict raised by this proposal is downgraded to a
    /// warning and the first observed definition is kept.
    #[serde(default)]
    pub ignore_conflict: bool,
}

impl Info {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        up_schema: impl Into<String>,
        up_table: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        ddls: Vec<String>,
        table_info_before: TableSchema,
        table_infos_after: Vec<TableSchema>,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            up_schema: up_schema.into(),
            up_table: up_table.into(),
            down_schema: down_schema.into(),
            down_table: down_table.into(),
            ddls,
            table_info_before,
            table_infos_after,
            ignore_conflict: false,
        }
    }

    /// Returns a copy of this proposal with `ignore_conflict` set.
    pub fn with_ignore_conflict(mut self) -> Self {
        self.ignore_conflict = true;
        self
    }
}

/// The conflict stage an [`Operation`] carries back to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStage {
    /// No conflict; apply the DDLs and mark done.
    None,
    /// The proposal conflicts with a peer; hold and wait for resolution.
    Detected,
    /// A previously detected conflict resolved; apply the DDLs.
    Resolved,
    /// The conflicting proposal was ignored on request; nothing to apply.
    Skipped,
    /// The lock was force-released; apply the catch-up DDLs (if any) and move on.
    Unlock,
}

impl ConflictStage {
    /// Returns whether a worker receiving this stage has DDLs to execute.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::None | Self::Resolved | Self::Unlock)
    }
}

/// The coordinator's decision for one source's upstream table.
///
/// Mutable only through explicit transitions: the worker executes `ddls` in
/// order and flips `done` to true; a new [`Info`] for the same table resets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Operation {
    pub task: String,
    pub source: String,
    pub up_schema: String,
    pub up_table: String,
    /// The DDLs this source must execute downstream, in order.
    pub ddls: Vec<String>,
    pub conflict_stage: ConflictStage,
    /// Human-readable conflict context when `conflict_stage` is not `none`.
    #[serde(default)]
    pub conflict_msg: String,
    /// Columns this decision newly added to the lock's tracked-column set.
    #[serde(default)]
    pub cols: Vec<String>,
    /// Set by the worker once the DDLs were applied downstream.
    pub done: bool,
    /// The KV mod-revision of this record. Not part of the payload; populated
    /// from store metadata on load and after writes.
    #[serde(skip)]
    pub revision: Revision,
}

impl Operation {
    /// Creates the decision answering `info`, carrying the emitted DDLs and
    /// tracked-column additions.
    pub fn new(
        info: &Info,
        ddls: Vec<String>,
        cols: Vec<String>,
        conflict_stage: ConflictStage,
        conflict_msg: impl Into<String>,
    ) -> Self {
        Self {
            task: info.task.clone(),
            source: info.source.clone(),
            up_schema: info.up_schema.clone(),
            up_table: info.up_table.clone(),
            ddls,
            conflict_stage,
            conflict_msg: conflict_msg.into(),
            cols,
            done: false,
            revision: 0,
        }
    }
}

/// The authoritative initial schema recorded for a downstream table the first
/// time its lock is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitSchema {
    pub task: String,
    pub down_schema: String,
    pub down_table: String,
    pub table_info: TableSchema,
}

impl InitSchema {
    pub fn new(
        task: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        table_info: TableSchema,
    ) -> Self {
        Self {
            task: task.into(),
            down_schema: down_schema.into(),
            down_table: down_table.into(),
            table_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_mysql::{ColumnSchema, TableName};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableName::new("foo", "bar"),
            vec![ColumnSchema::new("id", "INT", -1, false, true)],
        )
    }

    #[test]
    fn info_serializes_with_kebab_case_fields() {
        let info = Info::new(
            "task1",
            "mysql-replica-1",
            "foo_1",
            "bar_1",
            "foo",
            "bar",
            vec!["ALTER TABLE bar ADD COLUMN c1 INT".to_string()],
            schema(),
            vec![schema()],
        );

        let encoded = serde_json::to_string(&info).unwrap();
        assert!(encoded.contains("\"up-schema\""));
        assert!(encoded.contains("\"table-info-before\""));

        let decoded: Info = serde_json::from_str(&encoded).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn operation_revision_is_not_part_of_the_payload() {
        let info = Info::new(
            "task1",
            "mysql-replica-1",
            "foo_1",
            "bar_1",
            "foo",
            "bar",
            vec![],
            schema(),
            vec![],
        );
        let mut op = Operation::new(&info, vec![], vec![], ConflictStage::None, "");
        op.revision = 42;

        let encoded = serde_json::to_string(&op).unwrap();
        assert!(!encoded.contains("revision"));

        let decoded: Operation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.revision, 0);
    }

    #[test]
    fn conflict_stage_is_actionable_only_with_ddls_to_run() {
        assert!(ConflictStage::None.is_actionable());
        assert!(ConflictStage::Resolved.is_actionable());
        assert!(ConflictStage::Unlock.is_actionable());
        assert!(!ConflictStage::Detected.is_actionable());
        assert!(!ConflictStage::Skipped.is_actionable());
    }
}
