#![cfg(feature = "test-utils")]

use shardsync::coordination::{Lock, MemberKey};
use shardsync::error::ErrorKind;
use shardsync::records::{ConflictStage, Info};
use shardsync::store::{MemoryKvStore, optimism};
use shardsync::test_utils::{add_column_info, base_table, int_column, table_with_columns};
use shardsync_mysql::{ColumnSchema, TableSchema};
use shardsync_telemetry::tracing::init_test_tracing;

const TASK: &str = "task1";
const DOWN_SCHEMA: &str = "foo";
const DOWN_TABLE: &str = "bar";

fn new_lock(members: &[&str]) -> Lock {
    let keys = members
        .iter()
        .map(|source| MemberKey::new(*source, "foo_1", "bar_1"))
        .collect();
    Lock::new(TASK, DOWN_SCHEMA, DOWN_TABLE, base_table("foo", "bar"), keys)
}

fn add_info(source: &str, column: &str, before: TableSchema) -> Info {
    add_column_info(
        TASK,
        source,
        "foo_1",
        "bar_1",
        DOWN_SCHEMA,
        DOWN_TABLE,
        column,
        before,
    )
}

/// A single-statement proposal moving `before` to `after`.
fn info_between(source: &str, ddl: &str, before: TableSchema, after: TableSchema) -> Info {
    Info::new(
        TASK,
        source,
        "foo_1",
        "bar_1",
        DOWN_SCHEMA,
        DOWN_TABLE,
        vec![ddl.to_string()],
        before,
        vec![after],
    )
}

#[tokio::test]
async fn joined_schema_is_the_lub_of_member_schemas() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2", "s3"]);
    let before = base_table("foo", "bar");

    // Three sources add three different columns.
    for (source, column) in [("s1", "c1"), ("s2", "c2"), ("s3", "c3")] {
        let (ddls, cols) = lock
            .try_sync(&kv, &add_info(source, column, before.clone()))
            .await
            .unwrap();
        assert_eq!(ddls.len(), 1);
        assert!(cols.is_empty());
    }

    let joined = lock.joined().await;
    for column in ["id", "c1", "c2", "c3"] {
        assert!(joined.has_column(column));
    }

    // Each member's final schema is below the joined schema.
    let mut with_c1 = before.clone();
    with_c1.columns.push(int_column("c1"));
    assert!(with_c1.is_subset_of(&joined));

    // Not synced: every member lacks the columns the others added.
    let (synced, remain) = lock.is_synced().await;
    assert!(!synced);
    assert_eq!(remain, 3);
}

#[tokio::test]
async fn identical_adds_emit_for_every_source_and_sync() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");

    let i1 = add_info("s1", "c1", before.clone());
    let (ddls, cols) = lock.try_sync(&kv, &i1).await.unwrap();
    assert_eq!(ddls, i1.ddls);
    assert!(cols.is_empty());

    // The second source proposes the same add; it still receives the DDL to
    // apply on its own replication path.
    let i2 = add_info("s2", "c1", before);
    let (ddls, cols) = lock.try_sync(&kv, &i2).await.unwrap();
    assert_eq!(ddls, i2.ddls);
    assert!(cols.is_empty());

    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);

    // Acknowledgement drives the lock to resolved.
    assert!(!lock.is_resolved().await);
    assert!(lock.mark_done("s1", "foo_1", "bar_1").await);
    assert!(!lock.mark_done("s1", "foo_1", "bar_1").await);
    assert!(!lock.is_resolved().await);
    assert!(lock.mark_done("s2", "foo_1", "bar_1").await);
    assert!(lock.is_resolved().await);
}

#[tokio::test]
async fn identical_retry_returns_the_recorded_decision() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let info = add_info("s1", "c1", base_table("foo", "bar"));

    let first = lock.try_sync(&kv, &info).await.unwrap();
    let revision_after_first = kv.revision().await;

    let second = lock.try_sync(&kv, &info).await.unwrap();
    assert_eq!(first, second);
    // No KV write happened, so the operation revision did not advance.
    assert_eq!(kv.revision().await, revision_after_first);
}

#[tokio::test]
async fn drop_column_completes_only_after_unanimous_drop() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);

    let mut with_c1 = base_table("foo", "bar");
    with_c1.columns.push(int_column("c1"));

    // Bring both members to (id, c1) first.
    for source in ["s1", "s2"] {
        lock.try_sync(&kv, &add_info(source, "c1", base_table("foo", "bar")))
            .await
            .unwrap();
    }

    // s1 drops c1 while s2 still references it: the drop is withheld and the
    // column enters the tracked set.
    let drop1 = info_between(
        "s1",
        "ALTER TABLE bar DROP COLUMN c1",
        with_c1.clone(),
        base_table("foo", "bar"),
    );
    let (ddls, cols) = lock.try_sync(&kv, &drop1).await.unwrap();
    assert!(ddls.is_empty());
    assert_eq!(cols, vec!["c1".to_string()]);
    assert_eq!(lock.tracked_columns().await, vec!["c1".to_string()]);
    // The joined schema still carries the column for downstream readability.
    assert!(lock.joined().await.has_column("c1"));

    // s2 drops it as well: the drop is emitted and the column leaves the
    // tracked set.
    let drop2 = info_between(
        "s2",
        "ALTER TABLE bar DROP COLUMN c1",
        with_c1,
        base_table("foo", "bar"),
    );
    let (ddls, cols) = lock.try_sync(&kv, &drop2).await.unwrap();
    assert_eq!(ddls, drop2.ddls);
    assert!(cols.is_empty());
    assert!(lock.tracked_columns().await.is_empty());
    assert!(!lock.joined().await.has_column("c1"));

    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);
}

#[tokio::test]
async fn conflicting_adds_are_detected_and_resolve_when_proposals_converge() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");

    lock.try_sync(&kv, &add_info("s1", "c1", before.clone()))
        .await
        .unwrap();

    // s2 adds the same column with a different definition.
    let mut after = before.clone();
    after
        .columns
        .push(ColumnSchema::new("c1", "VARCHAR", 255, true, false));
    let conflicting = info_between(
        "s2",
        "ALTER TABLE bar ADD COLUMN c1 VARCHAR(255)",
        before.clone(),
        after,
    );
    let err = lock.try_sync(&kv, &conflicting).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ColumnConflict { column, .. } if column == "c1"));

    // The worker was handed a detected operation to hold on.
    let operation = optimism::get_operation(&kv, TASK, "s2", "foo_1", "bar_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.conflict_stage, ConflictStage::Detected);
    assert!(operation.ddls.is_empty());

    let (synced, _) = lock.is_synced().await;
    assert!(!synced);

    // s2 re-proposes with the matching definition; the conflict clears.
    let fixed = add_info("s2", "c1", before);
    let (ddls, cols) = lock.try_sync(&kv, &fixed).await.unwrap();
    assert_eq!(ddls, fixed.ddls);
    assert!(cols.is_empty());

    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);
}

#[tokio::test]
async fn incompatible_type_changes_park_until_peers_converge() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");
    let after = table_with_columns(
        "foo",
        "bar",
        vec![ColumnSchema::new("id", "BIGINT", -1, false, true)],
    );

    // s1 widens the primary key while s2 still has INT.
    let widen1 = info_between(
        "s1",
        "ALTER TABLE bar MODIFY COLUMN id BIGINT",
        before.clone(),
        after.clone(),
    );
    let err = lock.try_sync(&kv, &widen1).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ColumnTypeConflict { column, .. } if column == "id"));

    // The same change from s2 converges both proposals.
    let widen2 = info_between(
        "s2",
        "ALTER TABLE bar MODIFY COLUMN id BIGINT",
        before,
        after.clone(),
    );
    let (ddls, cols) = lock.try_sync(&kv, &widen2).await.unwrap();
    assert_eq!(ddls, widen2.ddls);
    assert!(cols.is_empty());

    // Both members received resolved operations and reached the new joined
    // schema.
    for source in ["s1", "s2"] {
        let operation = optimism::get_operation(&kv, TASK, source, "foo_1", "bar_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operation.conflict_stage, ConflictStage::Resolved);
        assert_eq!(operation.ddls.len(), 1);
    }
    assert_eq!(lock.joined().await, after);
    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);
}

#[tokio::test]
async fn ignore_conflict_keeps_the_first_observed_definition() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");

    lock.try_sync(&kv, &add_info("s1", "c1", before.clone()))
        .await
        .unwrap();

    let mut after = before.clone();
    after
        .columns
        .push(ColumnSchema::new("c1", "VARCHAR", 255, true, false));
    let conflicting = info_between(
        "s2",
        "ALTER TABLE bar ADD COLUMN c1 VARCHAR(255)",
        before,
        after,
    )
    .with_ignore_conflict();

    let (ddls, cols) = lock.try_sync(&kv, &conflicting).await.unwrap();
    assert!(ddls.is_empty());
    assert!(cols.is_empty());

    let operation = optimism::get_operation(&kv, TASK, "s2", "foo_1", "bar_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(operation.conflict_stage, ConflictStage::Skipped);

    // The joined schema keeps s1's INT definition and the lock syncs.
    let joined = lock.joined().await;
    assert_eq!(joined.column("c1").unwrap().typ, "INT");
    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);
}

#[tokio::test]
async fn multi_statement_proposals_replay_per_statement() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");

    let mut with_c1 = before.clone();
    with_c1.columns.push(int_column("c1"));
    let mut with_c1_c2 = with_c1.clone();
    with_c1_c2.columns.push(int_column("c2"));

    let info = Info::new(
        TASK,
        "s1",
        "foo_1",
        "bar_1",
        DOWN_SCHEMA,
        DOWN_TABLE,
        vec![
            "ALTER TABLE bar ADD COLUMN c1 INT".to_string(),
            "ALTER TABLE bar ADD COLUMN c2 INT".to_string(),
        ],
        before,
        vec![with_c1, with_c1_c2.clone()],
    );

    let (ddls, cols) = lock.try_sync(&kv, &info).await.unwrap();
    assert_eq!(ddls, info.ddls);
    assert!(cols.is_empty());
    assert_eq!(lock.joined().await, with_c1_c2);
}

#[tokio::test]
async fn unsupported_and_malformed_proposals_are_rejected() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1"]);
    let before = base_table("foo", "bar");

    // Two column additions inside one statement.
    let mut after = before.clone();
    after.columns.push(int_column("c1"));
    after.columns.push(int_column("c2"));
    let multi = info_between(
        "s1",
        "ALTER TABLE bar ADD COLUMN c1 INT, ADD COLUMN c2 INT",
        before.clone(),
        after,
    );
    let err = lock.try_sync(&kv, &multi).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsupportedDdl { .. }));

    // DDL count and post-state count must match.
    let mut malformed = add_info("s1", "c1", before);
    malformed.table_infos_after.clear();
    let err = lock.try_sync(&kv, &malformed).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InfoMalformed { .. }));

    // A rejected proposal leaves the lock untouched.
    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);
}

#[tokio::test]
async fn membership_changes_mid_lock() {
    init_test_tracing();

    let kv = MemoryKvStore::new();
    let lock = new_lock(&["s1", "s2"]);
    let before = base_table("foo", "bar");

    for source in ["s1", "s2"] {
        lock.try_sync(&kv, &add_info(source, "c1", before.clone()))
            .await
            .unwrap();
    }
    let (synced, _) = lock.is_synced().await;
    assert!(synced);

    // A late member starts from the recorded init schema and receives the
    // catch-up DDLs bridging it to the joined schema.
    let late = MemberKey::new("s3", "foo_1", "bar_1");
    let ddls = lock.add_table(late.clone()).await.unwrap().unwrap();
    assert_eq!(
        ddls,
        vec!["ALTER TABLE `foo`.`bar` ADD COLUMN `c1` INT".to_string()]
    );
    // Adding the same member again is a no-op.
    assert!(lock.add_table(late.clone()).await.unwrap().is_none());

    let (synced, remain) = lock.is_synced().await;
    assert!(!synced);
    assert_eq!(remain, 1);

    // Removing the member restores the previous state.
    assert!(lock.remove_table(&late).await);
    assert!(!lock.remove_table(&late).await);
    let (synced, remain) = lock.is_synced().await;
    assert!(synced);
    assert_eq!(remain, 0);

    // Removing the only member holding a tracked column releases it.
    let mut with_c1 = before.clone();
    with_c1.columns.push(int_column("c1"));
    let drop1 = info_between(
        "s1",
        "ALTER TABLE bar DROP COLUMN c1",
        with_c1,
        before.clone(),
    );
    lock.try_sync(&kv, &drop1).await.unwrap();
    assert_eq!(lock.tracked_columns().await, vec!["c1".to_string()]);

    assert!(lock.remove_table(&MemberKey::new("s2", "foo_1", "bar_1")).await);
    assert!(lock.tracked_columns().await.is_empty());
    assert!(!lock.joined().await.has_column("c1"));
}
