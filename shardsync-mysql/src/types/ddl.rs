use thiserror::Error;

use crate::types::schema::{TableName, TableSchema};

/// The atomic schema operations the coordinator understands.
///
/// Every DDL a source proposes must decompose into a sequence of these
/// operations, one per proposed statement. Statements whose before/after
/// schema pair encodes more than one primitive change are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterOp {
    /// A new column was added.
    AddColumn { name: String },
    /// An existing column was dropped.
    DropColumn { name: String },
    /// An existing column changed type, modifier, nullability or key membership.
    ModifyColumn { name: String },
    /// A column was renamed without changing its shape.
    RenameColumn { from: String, to: String },
    /// A secondary index was added.
    AddIndex { name: String },
    /// A secondary index was dropped.
    DropIndex { name: String },
    /// The schema is unchanged. Covers TRUNCATE and other data-only statements.
    NoOp,
}

/// Error type for transitions outside the atomic-operation alphabet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transition on {table} is not a single atomic operation: {detail}")]
    UnsupportedTransition { table: String, detail: String },
}

/// Classifies the transition between two adjacent table schemas as exactly one
/// [`AlterOp`].
///
/// The classification is purely structural: it diffs the column lists, index
/// lists and charset of `before` and `after`. A pair that differs in more than
/// one primitive way (or in a way the alphabet cannot express, such as a
/// charset change) fails with [`TransitionError::UnsupportedTransition`].
pub fn classify_transition(
    before: &TableSchema,
    after: &TableSchema,
) -> Result<AlterOp, TransitionError> {
    let unsupported = |detail: String| TransitionError::UnsupportedTransition {
        table: before.name.to_string(),
        detail,
    };

    if before.charset != after.charset {
        return Err(unsupported("table charset changed".to_string()));
    }

    let added: Vec<_> = after
        .columns
        .iter()
        .filter(|c| !before.has_column(&c.name))
        .collect();
    let dropped: Vec<_> = before
        .columns
        .iter()
        .filter(|c| !after.has_column(&c.name))
        .collect();
    let modified: Vec<_> = before
        .columns
        .iter()
        .filter_map(|b| after.column(&b.name).map(|a| (b, a)))
        .filter(|(b, a)| b != a)
        .collect();

    let idx_added: Vec<_> = after
        .indexes
        .iter()
        .filter(|i| before.index(&i.name).is_none())
        .collect();
    let idx_dropped: Vec<_> = before
        .indexes
        .iter()
        .filter(|i| after.index(&i.name).is_none())
        .collect();
    let idx_modified = before
        .indexes
        .iter()
        .filter_map(|b| after.index(&b.name).map(|a| (b, a)))
        .any(|(b, a)| b != a);

    if idx_modified {
        return Err(unsupported("index redefined in place".to_string()));
    }

    let column_changes = added.len() + dropped.len() + modified.len();
    let index_changes = idx_added.len() + idx_dropped.len();

    match (column_changes, index_changes) {
        (0, 0) => Ok(AlterOp::NoOp),
        (_, 0) => match (added.as_slice(), dropped.as_slice(), modified.as_slice()) {
            ([a], [], []) => Ok(AlterOp::AddColumn {
                name: a.name.clone(),
            }),
            ([], [d], []) => Ok(AlterOp::DropColumn {
                name: d.name.clone(),
            }),
            ([], [], [(_, a)]) => Ok(AlterOp::ModifyColumn {
                name: a.name.clone(),
            }),
            // A rename shows up as one add plus one drop of identically shaped
            // columns at the same ordinal position.
            ([a], [d], [])
                if a.typ == d.typ
                    && a.modifier == d.modifier
                    && a.nullable == d.nullable
                    && a.primary == d.primary =>
            {
                Ok(AlterOp::RenameColumn {
                    from: d.name.clone(),
                    to: a.name.clone(),
                })
            }
            _ => Err(unsupported(format!(
                "{} added, {} dropped, {} modified columns",
                added.len(),
                dropped.len(),
                modified.len()
            ))),
        },
        (0, _) => match (idx_added.as_slice(), idx_dropped.as_slice()) {
            ([i], []) => Ok(AlterOp::AddIndex {
                name: i.name.clone(),
            }),
            ([], [i]) => Ok(AlterOp::DropIndex {
                name: i.name.clone(),
            }),
            _ => Err(unsupported(format!(
                "{} added, {} dropped indexes",
                idx_added.len(),
                idx_dropped.len()
            ))),
        },
        _ => Err(unsupported(
            "column and index changes in one statement".to_string(),
        )),
    }
}

/// Renders the minimal ALTER statements that move a table from `from` to `to`.
///
/// Used when a schema gap exists without a recorded proposal to replay: a
/// member joining an in-flight lock must catch up to the joined schema, and a
/// force-released lock hands every lagging member its remaining distance.
/// Statements are ordered additions first, then drops, then modifications,
/// then index changes; each renders as one atomic operation.
pub fn render_catch_up_ddls(table: &TableName, from: &TableSchema, to: &TableSchema) -> Vec<String> {
    let target = table.as_quoted_identifier();
    let mut ddls = Vec::new();

    for col in &to.columns {
        if !from.has_column(&col.name) {
            ddls.push(format!(
                "ALTER TABLE {target} ADD COLUMN `{}` {}",
                col.name,
                col.definition()
            ));
        }
    }
    for col in &from.columns {
        if !to.has_column(&col.name) {
            ddls.push(format!("ALTER TABLE {target} DROP COLUMN `{}`", col.name));
        }
    }
    for col in &to.columns {
        if from.column(&col.name).is_some_and(|f| f != col) {
            ddls.push(format!(
                "ALTER TABLE {target} MODIFY COLUMN `{}` {}",
                col.name,
                col.definition()
            ));
        }
    }

    for idx in &to.indexes {
        if from.index(&idx.name).is_none() {
            let unique = if idx.unique { "UNIQUE " } else { "" };
            let columns = idx
                .columns
                .iter()
                .map(|c| format!("`{c}`"))
                .collect::<Vec<_>>()
                .join(", ");
            ddls.push(format!(
                "ALTER TABLE {target} ADD {unique}INDEX `{}` ({columns})",
                idx.name
            ));
        }
    }
    for idx in &from.indexes {
        if to.index(&idx.name).is_none() {
            ddls.push(format!("ALTER TABLE {target} DROP INDEX `{}`", idx.name));
        }
    }

    ddls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::schema::{ColumnSchema, IndexSchema, NO_MODIFIER};

    fn table(columns: Vec<ColumnSchema>) -> TableSchema {
        TableSchema::new(TableName::new("foo", "bar"), columns)
    }

    fn id() -> ColumnSchema {
        ColumnSchema::new("id", "INT", NO_MODIFIER, false, true)
    }

    #[test]
    fn classifies_add_column() {
        let before = table(vec![id()]);
        let after = table(vec![id(), ColumnSchema::new("c1", "INT", NO_MODIFIER, true, false)]);

        assert_eq!(
            classify_transition(&before, &after).unwrap(),
            AlterOp::AddColumn {
                name: "c1".to_string()
            }
        );
        assert_eq!(
            classify_transition(&after, &before).unwrap(),
            AlterOp::DropColumn {
                name: "c1".to_string()
            }
        );
    }

    #[test]
    fn classifies_modify_column() {
        let before = table(vec![id(), ColumnSchema::new("c1", "INT", NO_MODIFIER, true, false)]);
        let after = table(vec![
            id(),
            ColumnSchema::new("c1", "BIGINT", NO_MODIFIER, true, false),
        ]);

        assert_eq!(
            classify_transition(&before, &after).unwrap(),
            AlterOp::ModifyColumn {
                name: "c1".to_string()
            }
        );
    }

    #[test]
    fn classifies_rename_column() {
        let before = table(vec![id(), ColumnSchema::new("old", "INT", NO_MODIFIER, true, false)]);
        let after = table(vec![id(), ColumnSchema::new("new", "INT", NO_MODIFIER, true, false)]);

        assert_eq!(
            classify_transition(&before, &after).unwrap(),
            AlterOp::RenameColumn {
                from: "old".to_string(),
                to: "new".to_string()
            }
        );
    }

    #[test]
    fn rename_with_shape_change_is_unsupported() {
        let before = table(vec![id(), ColumnSchema::new("old", "INT", NO_MODIFIER, true, false)]);
        let after = table(vec![
            id(),
            ColumnSchema::new("new", "BIGINT", NO_MODIFIER, true, false),
        ]);

        assert!(classify_transition(&before, &after).is_err());
    }

    #[test]
    fn classifies_index_changes() {
        let before = table(vec![id()]);
        let mut after = table(vec![id()]);
        after
            .indexes
            .push(IndexSchema::new("idx", vec!["id".to_string()], false));

        assert_eq!(
            classify_transition(&before, &after).unwrap(),
            AlterOp::AddIndex {
                name: "idx".to_string()
            }
        );
        assert_eq!(
            classify_transition(&after, &before).unwrap(),
            AlterOp::DropIndex {
                name: "idx".to_string()
            }
        );
    }

    #[test]
    fn identical_schemas_are_a_noop() {
        let schema = table(vec![id()]);
        assert_eq!(classify_transition(&schema, &schema).unwrap(), AlterOp::NoOp);
    }

    #[test]
    fn catch_up_ddls_cover_the_schema_gap() {
        let from = table(vec![id(), ColumnSchema::new("gone", "INT", NO_MODIFIER, true, false)]);
        let mut to = table(vec![
            id(),
            ColumnSchema::new("c1", "VARCHAR", 255, true, false),
        ]);
        to.indexes
            .push(IndexSchema::new("idx_c1", vec!["c1".to_string()], true));

        let ddls = render_catch_up_ddls(&TableName::new("foo", "bar"), &from, &to);
        assert_eq!(
            ddls,
            vec![
                "ALTER TABLE `foo`.`bar` ADD COLUMN `c1` VARCHAR(255)".to_string(),
                "ALTER TABLE `foo`.`bar` DROP COLUMN `gone`".to_string(),
                "ALTER TABLE `foo`.`bar` ADD UNIQUE INDEX `idx_c1` (`c1`)".to_string(),
            ]
        );
    }

    #[test]
    fn catch_up_ddls_are_empty_for_equal_schemas() {
        let schema = table(vec![id()]);
        assert!(render_catch_up_ddls(&TableName::new("foo", "bar"), &schema, &schema).is_empty());
    }

    #[test]
    fn multi_operation_transitions_are_rejected() {
        let before = table(vec![id()]);
        let after = table(vec![
            id(),
            ColumnSchema::new("a", "INT", NO_MODIFIER, true, false),
            ColumnSchema::new("b", "INT", NO_MODIFIER, true, false),
        ]);

        let err = classify_transition(&before, &after).unwrap_err();
        assert!(matches!(err, TransitionError::UnsupportedTransition { .. }));
    }
}
