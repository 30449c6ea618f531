//! Per-backend type mapping and DDL rendering.

use super::ops::{ColumnSpec, DdlOp, FkAction};
use crate::catalog::ScalarType;
use trellis_proto::Value;

/// Backend-specific naming: semantic type to storage type string, value
/// literals, and DDL text rendering.
pub trait Platform {
    /// Platform name, for diagnostics.
    fn name(&self) -> &str;

    /// Map a semantic type to the backend's storage type string. The length
    /// parameter applies to string-like types that carry one.
    fn type_name(&self, scalar: ScalarType, length: Option<u32>) -> String;

    /// Render a value as a DDL default literal.
    fn value_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int32(i) => i.to_string(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => f.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Timestamp(t) => t.to_string(),
            Value::Uuid(u) => {
                let hex: String = u.iter().map(|b| format!("{b:02x}")).collect();
                format!("'{hex}'")
            }
            Value::Bytes(_) | Value::List(_) => "null".to_string(),
        }
    }

    /// Text emitted before a generated schema script.
    fn schema_beginning(&self) -> &str {
        ""
    }

    /// Text emitted after a generated schema script.
    fn schema_end(&self) -> &str {
        ""
    }

    /// Render a DDL operation as SQL text, terminated with a semicolon.
    fn render(&self, op: &DdlOp) -> String {
        match op {
            DdlOp::CreateTable {
                table,
                columns,
                foreign_keys,
            } => {
                let mut parts: Vec<String> =
                    columns.iter().map(|c| self.render_column(c)).collect();
                for fk in foreign_keys {
                    let mut clause = format!(
                        "foreign key (\"{}\") references \"{}\" (\"{}\") on delete {}",
                        fk.column,
                        fk.references_table,
                        fk.references_column,
                        render_action(fk.on_delete),
                    );
                    if let Some(action) = fk.on_update {
                        clause.push_str(&format!(" on update {}", render_action(action)));
                    }
                    parts.push(clause);
                }
                format!("create table \"{}\" ({});", table, parts.join(", "))
            }
            DdlOp::DropTable { table } => format!("drop table if exists \"{table}\";"),
            DdlOp::AddColumn { table, column } => format!(
                "alter table \"{}\" add column {};",
                table,
                self.render_column(column)
            ),
            DdlOp::DropColumn { table, column } => {
                format!("alter table \"{table}\" drop column \"{column}\";")
            }
            DdlOp::AlterColumn { table, column } => format!(
                "alter table \"{}\" alter column {};",
                table,
                self.render_column(column)
            ),
        }
    }

    /// Render a single column clause.
    fn render_column(&self, column: &ColumnSpec) -> String {
        let mut clause = format!("\"{}\" {}", column.name, column.column_type);
        if column.primary {
            clause.push_str(" primary key");
        }
        if !column.nullable && !column.primary {
            clause.push_str(" not null");
        }
        if column.unique && !column.primary {
            clause.push_str(" unique");
        }
        if let Some(default) = &column.default {
            clause.push_str(&format!(" default {default}"));
        }
        clause
    }
}

fn render_action(action: FkAction) -> &'static str {
    match action {
        FkAction::Cascade => "cascade",
        FkAction::SetNull => "set null",
    }
}

/// Generic ANSI-ish SQL platform with parameterized string lengths.
#[derive(Debug, Default)]
pub struct GenericSqlPlatform;

impl Platform for GenericSqlPlatform {
    fn name(&self) -> &str {
        "generic-sql"
    }

    fn type_name(&self, scalar: ScalarType, length: Option<u32>) -> String {
        match scalar {
            ScalarType::Bool => "boolean".to_string(),
            ScalarType::Int32 => "int".to_string(),
            ScalarType::Int64 => "bigint".to_string(),
            ScalarType::Float64 => "double precision".to_string(),
            ScalarType::String => format!("varchar({})", length.unwrap_or(255)),
            ScalarType::Bytes => "blob".to_string(),
            ScalarType::Timestamp => "timestamp".to_string(),
            ScalarType::Uuid => "uuid".to_string(),
        }
    }
}

/// Sqlite platform: a handful of storage classes and foreign-key pragmas
/// around generated scripts.
#[derive(Debug, Default)]
pub struct SqlitePlatform;

impl Platform for SqlitePlatform {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn type_name(&self, scalar: ScalarType, _length: Option<u32>) -> String {
        match scalar {
            ScalarType::Bool | ScalarType::Int32 | ScalarType::Int64 => "integer".to_string(),
            ScalarType::Float64 => "real".to_string(),
            ScalarType::Bytes => "blob".to_string(),
            ScalarType::String | ScalarType::Timestamp | ScalarType::Uuid => "text".to_string(),
        }
    }

    fn schema_beginning(&self) -> &str {
        "pragma foreign_keys = off;\n\n"
    }

    fn schema_end(&self) -> &str {
        "pragma foreign_keys = on;\n"
    }
}
