//! The coordination core: membership tracking, per-target-table locks, the
//! lock registry and the façade external subsystems call.

pub mod coordinator;
pub mod lock;
pub mod lock_keeper;
pub mod table_keeper;

pub use coordinator::Coordinator;
pub use lock::{Lock, MemberKey, lock_id};
pub use lock_keeper::{DownstreamMeta, DownstreamMetaResolver, LockKeeper};
pub use table_keeper::{
    SourceTables, SourceTablesMap, TableKeeper, TableRoute, TargetTable, target_tables_for_task,
};
