//! Typed persistence of coordination records.
//!
//! Thin bindings between the serde records and the raw [`KvStore`] surface:
//! encode/decode helpers, the init-schema write-once protocol, and the
//! consistent task snapshot a newly elected master rebuilds from.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::records::{Info, InitSchema, Operation};
use crate::store::base::{KvCompare, KvEntry, KvStore, KvTxn, Revision};
use crate::store::keys;

pub fn encode<T: Serialize>(value: &T) -> SyncResult<String> {
    serde_json::to_string(value)
        .map_err(|e| SyncError::with_source(ErrorKind::JsonSerializationFailed, e))
}

pub fn decode<T: DeserializeOwned>(value: &str) -> SyncResult<T> {
    serde_json::from_str(value)
        .map_err(|e| SyncError::with_source(ErrorKind::JsonDeserializationFailed, e))
}

/// Decodes an operation entry, restoring its revision from store metadata.
pub fn decode_operation(entry: &KvEntry) -> SyncResult<Operation> {
    let mut operation: Operation = decode(&entry.value)?;
    operation.revision = entry.mod_revision;
    Ok(operation)
}

pub async fn get_info<S: KvStore>(
    kv: &S,
    task: &str,
    source: &str,
    up_schema: &str,
    up_table: &str,
) -> SyncResult<Option<Info>> {
    let key = keys::info_key(task, source, up_schema, up_table);
    let entry = kv.get(&key).await?;
    entry.map(|e| decode(&e.value)).transpose()
}

pub async fn get_operation<S: KvStore>(
    kv: &S,
    task: &str,
    source: &str,
    up_schema: &str,
    up_table: &str,
) -> SyncResult<Option<Operation>> {
    let key = keys::operation_key(task, source, up_schema, up_table);
    let entry = kv.get(&key).await?;
    entry.as_ref().map(decode_operation).transpose()
}

/// Writes a single operation record, returning it with the commit revision set.
pub async fn put_operation<S: KvStore>(kv: &S, operation: &Operation) -> SyncResult<Operation> {
    let key = keys::operation_key(
        &operation.task,
        &operation.source,
        &operation.up_schema,
        &operation.up_table,
    );
    let revision = kv.put(&key, &encode(operation)?).await?;

    let mut stored = operation.clone();
    stored.revision = revision;
    Ok(stored)
}

/// Records the init schema for a downstream table unless one is already
/// present, and returns the authoritative record either way.
///
/// The write-once protocol makes lock creation deterministic across masters:
/// whichever master commits first wins, and every later creation (including
/// after failover) adopts the stored schema.
pub async fn ensure_init_schema<S: KvStore>(kv: &S, init: &InitSchema) -> SyncResult<InitSchema> {
    let key = keys::init_schema_key(&init.task, &init.down_schema, &init.down_table);

    let outcome = kv
        .txn(
            KvTxn::new()
                .when(KvCompare::KeyAbsent { key: key.clone() })
                .put(key.clone(), encode(init)?),
        )
        .await?;
    if outcome.succeeded {
        return Ok(init.clone());
    }

    match kv.get(&key).await? {
        Some(entry) => decode(&entry.value),
        None => Err(SyncError::invariant(format!(
            "init schema vanished between txn and read (key: {key})"
        ))),
    }
}

pub async fn get_init_schema<S: KvStore>(
    kv: &S,
    task: &str,
    down_schema: &str,
    down_table: &str,
) -> SyncResult<Option<InitSchema>> {
    let key = keys::init_schema_key(task, down_schema, down_table);
    let entry = kv.get(&key).await?;
    entry.map(|e| decode(&e.value)).transpose()
}

/// Everything persisted under one task, read in a single consistent snapshot.
#[derive(Debug, Default)]
pub struct TaskSnapshot {
    /// Proposals ordered by commit revision.
    pub infos: Vec<(Info, Revision)>,
    /// Decisions, revision already restored from store metadata.
    pub operations: Vec<Operation>,
    pub init_schemas: Vec<InitSchema>,
    /// Tracked columns as `(down_schema, down_table, column)` triples.
    pub columns: Vec<(String, String, String)>,
    /// The snapshot revision; watches resume from here.
    pub revision: Revision,
}

/// Loads the complete persisted state of `task`.
pub async fn load_task_snapshot<S: KvStore>(kv: &S, task: &str) -> SyncResult<TaskSnapshot> {
    let (entries, revision) = kv.scan_prefix(keys::ROOT_PREFIX).await?;

    let mut snapshot = TaskSnapshot {
        revision,
        ..Default::default()
    };

    for entry in entries {
        if let Some(components) = keys::split_key(keys::INFO_PREFIX, &entry.key) {
            if components.first().map(String::as_str) == Some(task) {
                snapshot.infos.push((decode(&entry.value)?, entry.mod_revision));
            }
        } else if let Some(components) = keys::split_key(keys::OPERATION_PREFIX, &entry.key) {
            if components.first().map(String::as_str) == Some(task) {
                snapshot.operations.push(decode_operation(&entry)?);
            }
        } else if let Some(components) = keys::split_key(keys::INIT_SCHEMA_PREFIX, &entry.key) {
            if components.first().map(String::as_str) == Some(task) {
                snapshot.init_schemas.push(decode(&entry.value)?);
            }
        } else if let Some(components) = keys::split_key(keys::COLUMN_PREFIX, &entry.key) {
            if let [t, down_schema, down_table, column] = components.as_slice()
                && t == task
            {
                snapshot
                    .columns
                    .push((down_schema.clone(), down_table.clone(), column.clone()));
            }
        }
    }

    snapshot.infos.sort_by_key(|(_, revision)| *revision);
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ConflictStage;
    use crate::store::MemoryKvStore;
    use shardsync_mysql::{ColumnSchema, TableName, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableName::new("foo", "bar"),
            vec![ColumnSchema::new("id", "INT", -1, false, true)],
        )
    }

    fn info(source: &str) -> Info {
        Info::new(
            "task1",
            source,
            "foo_1",
            "bar_1",
            "foo",
            "bar",
            vec!["ALTER TABLE bar ADD COLUMN c1 INT".to_string()],
            schema(),
            vec![schema()],
        )
    }

    #[tokio::test]
    async fn operation_round_trip_restores_revision() {
        let kv = MemoryKvStore::new();
        let operation = Operation::new(&info("s1"), vec![], vec![], ConflictStage::None, "");

        let stored = put_operation(&kv, &operation).await.unwrap();
        assert!(stored.revision > 0);

        let loaded = get_operation(&kv, "task1", "s1", "foo_1", "bar_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.revision, stored.revision);
    }

    #[tokio::test]
    async fn init_schema_is_write_once() {
        let kv = MemoryKvStore::new();
        let first = InitSchema::new("task1", "foo", "bar", schema());

        let stored = ensure_init_schema(&kv, &first).await.unwrap();
        assert_eq!(stored, first);

        // A competing write with a different schema adopts the stored one.
        let mut other_schema = schema();
        other_schema
            .columns
            .push(ColumnSchema::new("c1", "INT", -1, true, false));
        let second = InitSchema::new("task1", "foo", "bar", other_schema);
        let stored = ensure_init_schema(&kv, &second).await.unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn task_snapshot_filters_and_orders_by_revision() {
        let kv = MemoryKvStore::new();

        let i1 = info("s1");
        let i2 = info("s2");
        kv.put(
            &keys::info_key("task1", "s1", "foo_1", "bar_1"),
            &encode(&i1).unwrap(),
        )
        .await
        .unwrap();
        kv.put(
            &keys::info_key("task1", "s2", "foo_1", "bar_1"),
            &encode(&i2).unwrap(),
        )
        .await
        .unwrap();
        // A different task's record must not leak into the snapshot.
        kv.put(
            &keys::info_key("task2", "s1", "foo_1", "bar_1"),
            &encode(&info("s1")).unwrap(),
        )
        .await
        .unwrap();
        kv.put(&keys::column_key("task1", "foo", "bar", "c1"), "c1")
            .await
            .unwrap();

        let snapshot = load_task_snapshot(&kv, "task1").await.unwrap();
        assert_eq!(snapshot.infos.len(), 2);
        assert_eq!(snapshot.infos[0].0.source, "s1");
        assert_eq!(snapshot.infos[1].0.source, "s2");
        assert!(snapshot.infos[0].1 < snapshot.infos[1].1);
        assert_eq!(
            snapshot.columns,
            vec![("foo".to_string(), "bar".to_string(), "c1".to_string())]
        );
    }
}
