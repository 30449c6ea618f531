//! Structured DDL operations.
//!
//! The diff engine emits these; platforms render them to SQL text and
//! drivers apply them structurally.

use serde::{Deserialize, Serialize};
use trellis_proto::ColumnInfo;

/// Referential action on a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FkAction {
    /// Propagate the change to referencing rows.
    Cascade,
    /// Null out the referencing column.
    SetNull,
}

/// A column definition with its storage type already rendered for the
/// target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Storage type string (platform vocabulary).
    pub column_type: String,
    /// Whether the column accepts nulls.
    pub nullable: bool,
    /// Whether the column carries a unique constraint.
    pub unique: bool,
    /// Whether the column is the primary key.
    pub primary: bool,
    /// Default value literal.
    pub default: Option<String>,
}

impl ColumnSpec {
    /// Create a non-null column.
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: false,
            unique: false,
            primary: false,
            default: None,
        }
    }

    /// Create a primary-key column.
    pub fn primary(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        let mut spec = Self::new(name, column_type);
        spec.primary = true;
        spec
    }

    /// Mark as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the default literal.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// The live-column description this spec produces once applied.
    pub fn to_column_info(&self) -> ColumnInfo {
        ColumnInfo {
            name: self.name.clone(),
            column_type: self.column_type.clone(),
            nullable: self.nullable,
            default: self.default.clone(),
        }
    }
}

/// A foreign-key declaration inside a table create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    /// Referencing column on this table.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
    /// Action on delete of the referenced row.
    pub on_delete: FkAction,
    /// Action on update of the referenced key, if any.
    pub on_update: Option<FkAction>,
}

/// A single DDL operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlOp {
    /// Create a table with all its columns and constraints.
    CreateTable {
        /// Table name.
        table: String,
        /// Column definitions.
        columns: Vec<ColumnSpec>,
        /// Foreign-key declarations.
        foreign_keys: Vec<ForeignKeySpec>,
    },
    /// Drop a table if it exists.
    DropTable {
        /// Table name.
        table: String,
    },
    /// Add a column to an existing table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: ColumnSpec,
    },
    /// Drop a column from an existing table.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Alter an existing column in place.
    AlterColumn {
        /// Table name.
        table: String,
        /// New column definition.
        column: ColumnSpec,
    },
}

impl DdlOp {
    /// The table this operation applies to.
    pub fn table(&self) -> &str {
        match self {
            DdlOp::CreateTable { table, .. }
            | DdlOp::DropTable { table }
            | DdlOp::AddColumn { table, .. }
            | DdlOp::DropColumn { table, .. }
            | DdlOp::AlterColumn { table, .. } => table,
        }
    }
}
