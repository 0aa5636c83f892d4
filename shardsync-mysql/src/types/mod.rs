mod compare;
mod ddl;
mod schema;

pub use compare::SchemaJoinError;
pub use ddl::{AlterOp, TransitionError, classify_transition, render_catch_up_ddls};
pub use schema::{ColumnSchema, IndexSchema, TableName, TableSchema};
