use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified MySQL table name consisting of a schema (database) and table name.
///
/// This type represents a table identifier in MySQL, which requires both a schema name
/// (database name) and a table name. It provides methods for formatting the name in
/// different contexts.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// The schema (database) name containing the table.
    pub schema: String,
    /// The name of the table within the schema.
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the table name as a properly quoted MySQL identifier.
    ///
    /// This method ensures the schema and table names are properly escaped according to
    /// MySQL identifier quoting rules using backticks. Embedded backticks are doubled.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "`{}`.`{}`",
            self.schema.replace('`', "``"),
            self.name.replace('`', "``")
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// A type alias for MySQL type modifiers.
///
/// Type modifiers in MySQL are used to specify additional type-specific attributes,
/// such as length for varchar or precision for numeric types.
type TypeModifier = i32;

/// The modifier value for types that carry no additional attribute.
pub const NO_MODIFIER: TypeModifier = -1;

/// Represents the schema of a single column in a MySQL table.
///
/// This type contains all metadata about a column including its name, data type,
/// type modifier, nullability, and whether it's part of the primary key.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// The name of the column.
    pub name: String,
    /// The MySQL data type of the column as a string.
    pub typ: String,
    /// Type-specific modifier value (e.g., length for varchar).
    pub modifier: TypeModifier,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
    /// Whether the column is part of the table's primary key.
    pub primary: bool,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        typ: impl Into<String>,
        modifier: TypeModifier,
        nullable: bool,
        primary: bool,
    ) -> ColumnSchema {
        Self {
            name: name.into(),
            typ: typ.into(),
            modifier,
            nullable,
            primary,
        }
    }

    /// Returns whether `self` and `other` describe the same column shape, ignoring
    /// nullability.
    ///
    /// Two columns with the same name, type, modifier and primary-key membership are
    /// mergeable even when their nullability differs; the merged column relaxes to
    /// the more permissive nullability.
    pub fn same_shape(&self, other: &ColumnSchema) -> bool {
        self.name == other.name
            && self.typ == other.typ
            && self.modifier == other.modifier
            && self.primary == other.primary
    }

    /// Returns a short human-readable rendering of the column definition, used in
    /// conflict diagnostics.
    pub fn definition(&self) -> String {
        let mut out = self.typ.clone();
        if self.modifier != NO_MODIFIER {
            out.push_str(&format!("({})", self.modifier));
        }
        if !self.nullable {
            out.push_str(" NOT NULL");
        }
        if self.primary {
            out.push_str(" PRIMARY KEY");
        }
        out
    }
}

/// Represents a secondary index on a MySQL table.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IndexSchema {
    /// The name of the index.
    pub name: String,
    /// The indexed column names, in index order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>, unique: bool) -> IndexSchema {
        Self {
            name: name.into(),
            columns,
            unique,
        }
    }
}

/// Represents the complete schema of a MySQL table.
///
/// This type contains all metadata about a table including its name, the schemas of
/// all its columns, its secondary indexes and its charset. It is the unit the
/// coordinator compares and joins when reconciling concurrent schema changes across
/// upstream shards.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// The fully qualified name of the table.
    pub name: TableName,
    /// The schemas of all columns in the table, in definition order.
    pub columns: Vec<ColumnSchema>,
    /// Secondary indexes defined on the table.
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    /// The table charset, when explicitly set.
    #[serde(default)]
    pub charset: Option<String>,
}

impl TableSchema {
    pub fn new(name: TableName, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name,
            columns,
            indexes: Vec::new(),
            charset: None,
        }
    }

    /// Returns the number of columns in the table.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Returns the column with the given name, if present.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns whether the table has a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Returns the index with the given name, if present.
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Returns whether the table has any primary key columns.
    pub fn has_primary_keys(&self) -> bool {
        self.columns.iter().any(|c| c.primary)
    }
}
