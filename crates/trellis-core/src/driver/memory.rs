//! In-memory reference driver.
//!
//! Backs the test-suite and serves as the smallest complete [`Driver`]
//! implementation. Rows are kept as structured values per table; DDL is
//! applied structurally, so introspection reflects exactly the operations
//! that were executed. Without DDL the key column defaults to `id`.

use super::{Driver, DriverCapabilities, DriverError};
use crate::schema::{ColumnSpec, DdlOp};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use trellis_proto::{ColumnInfo, Criteria, FindOptions, OrderDirection, Row, Value};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    columns: Vec<ColumnSpec>,
    declared: bool,
    primary: Option<String>,
    next_key: i64,
}

impl Table {
    fn key_field(&self) -> &str {
        self.primary.as_deref().unwrap_or("id")
    }

    fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.unique || c.primary)
            .map(|c| c.name.as_str())
    }
}

/// An in-memory [`Driver`] implementation.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    tables: Mutex<BTreeMap<String, Table>>,
}

impl MemoryDriver {
    /// Create an empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows in a table, for assertions.
    pub fn row_count(&self, collection: &str) -> usize {
        self.tables
            .lock()
            .get(collection)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

/// Check whether a stored value satisfies an equality condition. A stored
/// list matches when it contains the condition value (membership, the way
/// document stores treat array fields).
fn matches_condition(stored: Option<&Value>, expected: &Value) -> bool {
    match stored {
        Some(Value::List(items)) if !matches!(expected, Value::List(_)) => {
            items.contains(expected)
        }
        Some(v) => v == expected,
        None => expected.is_null(),
    }
}

fn matches_criteria(row: &Row, criteria: &Criteria) -> bool {
    criteria
        .conditions()
        .all(|(field, expected)| matches_condition(row.get(field), expected))
}

/// Total order over values for sorting; rows with nulls sort first.
fn value_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_) | Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Uuid(_) => 7,
            Value::List(_) => 8,
        }
    }

    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a), Some(b)) => (a, b),
    };

    match (a, b) {
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            a.as_i64().cmp(&b.as_i64())
        }
        (Value::Float64(x), Value::Float64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl Driver for MemoryDriver {
    fn find(
        &self,
        collection: &str,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<Row>, DriverError> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(collection) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| matches_criteria(row, criteria))
            .cloned()
            .collect();

        for (field, direction) in options.order_by.iter().rev() {
            rows.sort_by(|a, b| {
                let ordering = value_cmp(a.get(field), b.get(field));
                match direction {
                    OrderDirection::Asc => ordering,
                    OrderDirection::Desc => ordering.reverse(),
                }
            });
        }

        let offset = options.offset.unwrap_or(0);
        let mut rows: Vec<Row> = rows.into_iter().skip(offset).collect();
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        Ok(rows)
    }

    fn insert(&self, collection: &str, row: &Row) -> Result<Value, DriverError> {
        let mut tables = self.tables.lock();
        let table = tables.entry(collection.to_string()).or_default();

        let key_field = table.key_field().to_string();
        let mut row = row.clone();
        let key = match row.get(&key_field) {
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                table.next_key += 1;
                let key = Value::Int64(table.next_key);
                row.set(key_field.clone(), key.clone());
                key
            }
        };

        let unique: Vec<String> = table
            .unique_fields()
            .map(String::from)
            .chain(std::iter::once(key_field))
            .collect();
        for field in &unique {
            let candidate = row.get(field);
            let clash = table.rows.iter().any(|existing| {
                matches!((existing.get(field), candidate), (Some(a), Some(b)) if !a.is_null() && a == b)
            });
            if clash {
                return Err(DriverError::Constraint {
                    message: format!("duplicate value for unique field '{collection}.{field}'"),
                });
            }
        }

        table.rows.push(row);
        Ok(key)
    }

    fn update(
        &self,
        collection: &str,
        criteria: &Criteria,
        changes: &[(String, Value)],
    ) -> Result<usize, DriverError> {
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(collection) else {
            return Ok(0);
        };

        let unique: Vec<String> = table.unique_fields().map(String::from).collect();
        let targets: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| matches_criteria(row, criteria))
            .map(|(i, _)| i)
            .collect();

        for &i in &targets {
            for (field, value) in changes {
                if unique.contains(field) && !value.is_null() {
                    let clash = table
                        .rows
                        .iter()
                        .enumerate()
                        .any(|(j, other)| j != i && other.get(field) == Some(value));
                    if clash {
                        return Err(DriverError::Constraint {
                            message: format!(
                                "duplicate value for unique field '{collection}.{field}'"
                            ),
                        });
                    }
                }
            }
            for (field, value) in changes {
                table.rows[i].set(field.clone(), value.clone());
            }
        }

        Ok(targets.len())
    }

    fn delete(&self, collection: &str, criteria: &Criteria) -> Result<usize, DriverError> {
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(collection) else {
            return Ok(0);
        };

        let before = table.rows.len();
        table.rows.retain(|row| !matches_criteria(row, criteria));
        Ok(before - table.rows.len())
    }

    fn list_tables(&self) -> Result<Vec<String>, DriverError> {
        Ok(self
            .tables
            .lock()
            .iter()
            .filter(|(_, t)| t.declared)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>, DriverError> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.columns.iter().map(ColumnSpec::to_column_info).collect())
            .unwrap_or_default())
    }

    fn execute(&self, op: &DdlOp) -> Result<(), DriverError> {
        let mut tables = self.tables.lock();
        match op {
            DdlOp::CreateTable { table, columns, .. } => {
                let entry = tables.entry(table.clone()).or_default();
                if entry.declared {
                    return Err(DriverError::Backend(format!(
                        "table '{table}' already exists"
                    )));
                }
                entry.declared = true;
                entry.columns = columns.clone();
                entry.primary = columns.iter().find(|c| c.primary).map(|c| c.name.clone());
            }
            DdlOp::DropTable { table } => {
                tables.remove(table);
            }
            DdlOp::AddColumn { table, column } => {
                let entry = tables
                    .get_mut(table)
                    .ok_or_else(|| DriverError::Backend(format!("no such table '{table}'")))?;
                entry.columns.push(column.clone());
            }
            DdlOp::DropColumn { table, column } => {
                let entry = tables
                    .get_mut(table)
                    .ok_or_else(|| DriverError::Backend(format!("no such table '{table}'")))?;
                entry.columns.retain(|c| c.name != *column);
            }
            DdlOp::AlterColumn { table, column } => {
                let entry = tables
                    .get_mut(table)
                    .ok_or_else(|| DriverError::Backend(format!("no such table '{table}'")))?;
                match entry.columns.iter_mut().find(|c| c.name == column.name) {
                    Some(existing) => *existing = column.clone(),
                    None => {
                        return Err(DriverError::Backend(format!(
                            "no such column '{}.{}'",
                            table, column.name
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            transactions: false,
            schema_constraints: true,
            column_alter: true,
            nullable_for_alter: false,
            index_foreign_keys: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_generates_key() {
        let driver = MemoryDriver::new();
        let key = driver
            .insert("user", &Row::new().with("name", "Alice"))
            .unwrap();
        assert_eq!(key, Value::Int64(1));

        let key = driver
            .insert("user", &Row::new().with("name", "Bob"))
            .unwrap();
        assert_eq!(key, Value::Int64(2));
    }

    #[test]
    fn test_insert_honors_provided_key() {
        let driver = MemoryDriver::new();
        let key = driver
            .insert("user", &Row::new().with("id", 42i64).with("name", "Alice"))
            .unwrap();
        assert_eq!(key, Value::Int64(42));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let driver = MemoryDriver::new();
        driver
            .insert("user", &Row::new().with("id", 1i64))
            .unwrap();
        let result = driver.insert("user", &Row::new().with("id", 1i64));
        assert!(matches!(result, Err(DriverError::Constraint { .. })));
    }

    #[test]
    fn test_find_with_criteria_and_order() {
        let driver = MemoryDriver::new();
        for (name, age) in [("Carol", 35i64), ("Alice", 30), ("Bob", 25)] {
            driver
                .insert("user", &Row::new().with("name", name).with("age", age))
                .unwrap();
        }

        let rows = driver
            .find(
                "user",
                &Criteria::new(),
                &FindOptions::new().order_asc("age"),
            )
            .unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::String("Bob".into())));
        assert_eq!(rows[2].get("name"), Some(&Value::String("Carol".into())));

        let rows = driver
            .find(
                "user",
                &Criteria::new().eq("name", "Alice"),
                &FindOptions::new(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_list_field_membership() {
        let driver = MemoryDriver::new();
        driver
            .insert(
                "post",
                &Row::new().with(
                    "tags",
                    Value::List(vec![Value::Int64(1), Value::Int64(2)]),
                ),
            )
            .unwrap();

        let rows = driver
            .find(
                "post",
                &Criteria::new().eq("tags", 2i64),
                &FindOptions::new(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = driver
            .find(
                "post",
                &Criteria::new().eq("tags", 3i64),
                &FindOptions::new(),
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_update_and_delete() {
        let driver = MemoryDriver::new();
        driver
            .insert("user", &Row::new().with("id", 1i64).with("name", "Alice"))
            .unwrap();

        let affected = driver
            .update(
                "user",
                &Criteria::new().eq("id", 1i64),
                &[("name".to_string(), Value::String("Alicia".into()))],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let rows = driver
            .find("user", &Criteria::new().eq("id", 1i64), &FindOptions::new())
            .unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::String("Alicia".into())));

        let affected = driver
            .delete("user", &Criteria::new().eq("id", 1i64))
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(driver.row_count("user"), 0);
    }

    #[test]
    fn test_ddl_reflected_by_introspection() {
        let driver = MemoryDriver::new();
        driver
            .execute(&DdlOp::CreateTable {
                table: "user".into(),
                columns: vec![
                    ColumnSpec::primary("id", "bigint"),
                    ColumnSpec::new("name", "text"),
                ],
                foreign_keys: Vec::new(),
            })
            .unwrap();

        assert_eq!(driver.list_tables().unwrap(), vec!["user".to_string()]);
        let columns = driver.column_info("user").unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");

        driver
            .execute(&DdlOp::AddColumn {
                table: "user".into(),
                column: ColumnSpec::new("email", "text"),
            })
            .unwrap();
        assert_eq!(driver.column_info("user").unwrap().len(), 3);

        driver
            .execute(&DdlOp::DropTable {
                table: "user".into(),
            })
            .unwrap();
        assert!(driver.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_transactions_unsupported() {
        let driver = MemoryDriver::new();
        assert!(!driver.capabilities().transactions);
        assert!(matches!(
            driver.begin(),
            Err(DriverError::Unsupported { .. })
        ));
    }
}
