//! Shared builders for unit and integration tests.

pub mod schema;

pub use schema::{
    add_column_info, base_table, id_column, int_column, nil_resolver, static_resolver,
    table_with_columns, target_table,
};
