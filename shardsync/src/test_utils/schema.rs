use std::collections::BTreeMap;
use std::sync::Arc;

use shardsync_config::shared::{MySqlConnectionConfig, TlsConfig};
use shardsync_mysql::{ColumnSchema, TableName, TableSchema};

use crate::coordination::{DownstreamMetaResolver, TargetTable};
use crate::records::Info;

/// The primary-key column every test table starts from.
pub fn id_column() -> ColumnSchema {
    ColumnSchema::new("id", "INT", -1, false, true)
}

/// A nullable INT column.
pub fn int_column(name: &str) -> ColumnSchema {
    ColumnSchema::new(name, "INT", -1, true, false)
}

/// `CREATE TABLE <schema>.<table> (id INT PRIMARY KEY)`.
pub fn base_table(schema: &str, table: &str) -> TableSchema {
    TableSchema::new(TableName::new(schema, table), vec![id_column()])
}

pub fn table_with_columns(schema: &str, table: &str, columns: Vec<ColumnSchema>) -> TableSchema {
    TableSchema::new(TableName::new(schema, table), columns)
}

/// Builds a [`TargetTable`] from `(up_schema, [up_tables])` routing pairs.
pub fn target_table(
    task: &str,
    source: &str,
    down_schema: &str,
    down_table: &str,
    routes: &[(&str, &[&str])],
) -> TargetTable {
    let mut up_tables = BTreeMap::new();
    for (up_schema, tables) in routes {
        up_tables.insert(
            up_schema.to_string(),
            tables.iter().map(|t| t.to_string()).collect(),
        );
    }
    TargetTable::new(task, source, down_schema, down_table, up_tables)
}

/// The canonical single-statement proposal: `ALTER TABLE <down_table> ADD
/// COLUMN <column> INT` moving the member from `before` to `before + column`.
#[allow(clippy::too_many_arguments)]
pub fn add_column_info(
    task: &str,
    source: &str,
    up_schema: &str,
    up_table: &str,
    down_schema: &str,
    down_table: &str,
    column: &str,
    before: TableSchema,
) -> Info {
    let mut after = before.clone();
    after.columns.push(int_column(column));

    Info::new(
        task,
        source,
        up_schema,
        up_table,
        down_schema,
        down_table,
        vec![format!("ALTER TABLE {down_table} ADD COLUMN {column} INT")],
        before,
        vec![after],
    )
}

/// A resolver that knows no task.
pub fn nil_resolver() -> DownstreamMetaResolver {
    Arc::new(|_task| (None, String::new()))
}

/// A resolver answering `(config, "meta")` for the given tasks and
/// `(None, "")` otherwise.
pub fn static_resolver(tasks: &[&str]) -> DownstreamMetaResolver {
    let tasks: Vec<String> = tasks.iter().map(|t| t.to_string()).collect();
    Arc::new(move |task| {
        if tasks.iter().any(|t| t == task) {
            let config = MySqlConnectionConfig {
                host: "localhost".to_string(),
                port: 3306,
                name: "meta".to_string(),
                username: "root".to_string(),
                password: None,
                tls: TlsConfig {
                    trusted_root_certs: String::new(),
                    enabled: false,
                },
            };
            (Some(config), "meta".to_string())
        } else {
            (None, String::new())
        }
    })
}
