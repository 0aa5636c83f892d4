use std::cmp::Ordering;
use thiserror::Error;

use crate::types::schema::{ColumnSchema, TableSchema};

/// Error type for schema join failures.
///
/// A join fails when two schemas disagree on the shape of the same object. The
/// variants carry enough context for callers to report which member and column
/// caused the disagreement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaJoinError {
    #[error("conflicting definitions for column `{column}`: {left} vs {right}")]
    ColumnTypeConflict {
        column: String,
        left: String,
        right: String,
    },

    #[error("conflicting definitions for index `{index}`")]
    IndexConflict { index: String },

    #[error("conflicting table charsets: {left} vs {right}")]
    CharsetConflict { left: String, right: String },
}

/// Returns whether column `a` is no more permissive than column `b`.
///
/// Requires identical name, type, modifier and primary-key membership; a
/// NOT NULL column is below its nullable counterpart.
fn column_le(a: &ColumnSchema, b: &ColumnSchema) -> bool {
    a.same_shape(b) && (!a.nullable || b.nullable)
}

/// Returns whether every object of `a` appears in `b` with a compatible shape.
fn subsumes(b: &TableSchema, a: &TableSchema) -> bool {
    let columns_ok = a
        .columns
        .iter()
        .all(|ca| b.column(&ca.name).is_some_and(|cb| column_le(ca, cb)));
    let indexes_ok = a
        .indexes
        .iter()
        .all(|ia| b.index(&ia.name).is_some_and(|ib| ib == ia));
    let charset_ok = match (&a.charset, &b.charset) {
        (None, _) => true,
        (Some(ca), Some(cb)) => ca == cb,
        (Some(_), None) => false,
    };

    columns_ok && indexes_ok && charset_ok
}

impl TableSchema {
    /// Compares two schemas under the coordinator's partial order.
    ///
    /// `a <= b` holds when every column of `a` appears in `b` with the same
    /// type, modifier and primary-key membership and no-more-permissive
    /// nullability, every index of `a` appears identically in `b`, and the
    /// charsets agree (an unset charset is below a set one). Returns `None`
    /// when the schemas are incomparable, e.g. each carries a column the
    /// other lacks.
    ///
    /// Table names are not part of the order: upstream shards routed into one
    /// downstream table legitimately differ in name.
    pub fn compare(&self, other: &TableSchema) -> Option<Ordering> {
        let le = subsumes(other, self);
        let ge = subsumes(self, other);

        match (le, ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// Returns whether `self` is below or equal to `other` in the partial order.
    pub fn is_subset_of(&self, other: &TableSchema) -> bool {
        subsumes(other, self)
    }

    /// Computes the least upper bound of two schemas.
    ///
    /// The joined schema contains every column of both inputs: shared columns
    /// keep their shape and relax nullability to the more permissive side,
    /// `self`-only columns keep their position, `other`-only columns are
    /// appended in `other`'s order. Indexes are united by name and charsets
    /// merged. The join fails when the inputs disagree on the shape of a
    /// shared column or index, or carry different explicit charsets.
    ///
    /// The result keeps `self`'s table name.
    pub fn join(&self, other: &TableSchema) -> Result<TableSchema, SchemaJoinError> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for ca in &self.columns {
            match other.column(&ca.name) {
                Some(cb) if ca.same_shape(cb) => {
                    let mut merged = ca.clone();
                    merged.nullable = ca.nullable || cb.nullable;
                    columns.push(merged);
                }
                Some(cb) => {
                    return Err(SchemaJoinError::ColumnTypeConflict {
                        column: ca.name.clone(),
                        left: ca.definition(),
                        right: cb.definition(),
                    });
                }
                None => columns.push(ca.clone()),
            }
        }
        for cb in &other.columns {
            if !self.has_column(&cb.name) {
                columns.push(cb.clone());
            }
        }

        let mut indexes = self.indexes.clone();
        for ib in &other.indexes {
            match self.index(&ib.name) {
                Some(ia) if ia == ib => {}
                Some(_) => {
                    return Err(SchemaJoinError::IndexConflict {
                        index: ib.name.clone(),
                    });
                }
                None => indexes.push(ib.clone()),
            }
        }

        let charset = match (&self.charset, &other.charset) {
            (Some(ca), Some(cb)) if ca != cb => {
                return Err(SchemaJoinError::CharsetConflict {
                    left: ca.clone(),
                    right: cb.clone(),
                });
            }
            (Some(ca), _) => Some(ca.clone()),
            (None, cb) => cb.clone(),
        };

        Ok(TableSchema {
            name: self.name.clone(),
            columns,
            indexes,
            charset,
        })
    }

    /// Joins every schema in `others` onto `self`, left to right.
    pub fn join_all<'a, I>(&self, others: I) -> Result<TableSchema, SchemaJoinError>
    where
        I: IntoIterator<Item = &'a TableSchema>,
    {
        let mut joined = self.clone();
        for other in others {
            joined = joined.join(other)?;
        }
        Ok(joined)
    }
}
