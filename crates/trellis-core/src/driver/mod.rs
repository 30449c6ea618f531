//! Driver boundary: the interface the kernel needs from a backend.
//!
//! Drivers are external collaborators; the kernel issues every read, write,
//! and schema primitive through [`Driver`]. The session model is
//! single-threaded cooperative, so the trait is synchronous: ordering
//! between driver calls is exactly program order within one session.

mod memory;

pub use memory::MemoryDriver;

use crate::schema::DdlOp;
use thiserror::Error;
use trellis_proto::{ColumnInfo, Criteria, FindOptions, Row, Value};

/// Errors reported by driver implementations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A storage constraint was violated (uniqueness, foreign key).
    /// Propagated unmodified by the kernel.
    #[error("constraint violation: {message}")]
    Constraint {
        /// Backend-supplied description of the violated constraint.
        message: String,
    },

    /// The operation is not supported by this driver. Surfaced immediately,
    /// never retried.
    #[error("operation not supported by this driver: {operation}")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: String,
    },

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// Convenience constructor for [`DriverError::Unsupported`].
    pub fn unsupported(operation: impl Into<String>) -> Self {
        DriverError::Unsupported {
            operation: operation.into(),
        }
    }
}

/// Capability flags reported by a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Write batches can be wrapped in a transaction.
    pub transactions: bool,
    /// The backend enforces declared foreign-key constraints.
    pub schema_constraints: bool,
    /// Existing columns can be altered in place.
    pub column_alter: bool,
    /// Altering a column forces it nullable.
    pub nullable_for_alter: bool,
    /// Foreign-key columns are indexed implicitly.
    pub index_foreign_keys: bool,
}

/// The interface a backend must provide to the kernel.
pub trait Driver {
    /// Find rows matching the criteria.
    fn find(
        &self,
        collection: &str,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<Row>, DriverError>;

    /// Insert a row and return its primary key. When the row carries no key
    /// the driver generates one.
    fn insert(&self, collection: &str, row: &Row) -> Result<Value, DriverError>;

    /// Update matching rows with the given field changes. Returns the
    /// affected count.
    fn update(
        &self,
        collection: &str,
        criteria: &Criteria,
        changes: &[(String, Value)],
    ) -> Result<usize, DriverError>;

    /// Delete matching rows. Returns the affected count.
    fn delete(&self, collection: &str, criteria: &Criteria) -> Result<usize, DriverError>;

    /// List the live tables.
    fn list_tables(&self) -> Result<Vec<String>, DriverError>;

    /// Describe the live columns of a table.
    fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>, DriverError>;

    /// Apply a DDL operation.
    fn execute(&self, op: &DdlOp) -> Result<(), DriverError>;

    /// Begin a transaction, when supported.
    fn begin(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("transactions"))
    }

    /// Commit the current transaction, when supported.
    fn commit(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("transactions"))
    }

    /// Roll back the current transaction, when supported.
    fn rollback(&self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("transactions"))
    }

    /// Capability flags of this driver.
    fn capabilities(&self) -> DriverCapabilities;
}
