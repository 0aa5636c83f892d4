//! Key namespace for coordination records.
//!
//! Every record lives under a well-known prefix:
//!
//! - `shardddl/optimism/info/<task>/<source>/<upSchema>/<upTable>`
//! - `shardddl/optimism/operation/<task>/<source>/<upSchema>/<upTable>`
//! - `shardddl/optimism/init-schema/<task>/<downSchema>/<downTable>`
//! - `shardddl/optimism/column/<task>/<downSchema>/<downTable>/<column>`
//!
//! Path components are percent-escaped so user-controlled names containing
//! `/` cannot break out of their slot.

/// Root prefix of all optimistic shard-DDL records.
pub const ROOT_PREFIX: &str = "shardddl/optimism/";

pub const INFO_PREFIX: &str = "shardddl/optimism/info/";
pub const OPERATION_PREFIX: &str = "shardddl/optimism/operation/";
pub const INIT_SCHEMA_PREFIX: &str = "shardddl/optimism/init-schema/";
pub const COLUMN_PREFIX: &str = "shardddl/optimism/column/";

/// Escapes one path component.
fn escape(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

/// Reverses [`escape`].
fn unescape(component: &str) -> String {
    component.replace("%2F", "/").replace("%25", "%")
}

fn join(prefix: &str, components: &[&str]) -> String {
    let mut key = String::from(prefix);
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            key.push('/');
        }
        key.push_str(&escape(component));
    }
    key
}

pub fn info_key(task: &str, source: &str, up_schema: &str, up_table: &str) -> String {
    join(INFO_PREFIX, &[task, source, up_schema, up_table])
}

pub fn info_prefix_for_task(task: &str) -> String {
    format!("{}{}/", INFO_PREFIX, escape(task))
}

pub fn operation_key(task: &str, source: &str, up_schema: &str, up_table: &str) -> String {
    join(OPERATION_PREFIX, &[task, source, up_schema, up_table])
}

pub fn operation_prefix_for_source(task: &str, source: &str) -> String {
    format!("{}{}/{}/", OPERATION_PREFIX, escape(task), escape(source))
}

pub fn init_schema_key(task: &str, down_schema: &str, down_table: &str) -> String {
    join(INIT_SCHEMA_PREFIX, &[task, down_schema, down_table])
}

pub fn column_key(task: &str, down_schema: &str, down_table: &str, column: &str) -> String {
    join(COLUMN_PREFIX, &[task, down_schema, down_table, column])
}

/// Splits `key` under `prefix` into its decoded components.
///
/// Returns `None` when the key does not start with the prefix.
pub fn split_key(prefix: &str, key: &str) -> Option<Vec<String>> {
    let rest = key.strip_prefix(prefix)?;
    Some(rest.split('/').map(unescape).collect())
}
