//! Trellis protocol vocabulary - values, rows, and criteria.
//!
//! This crate defines the runtime data types exchanged between the Trellis
//! persistence kernel and driver implementations. It carries no I/O of its
//! own; drivers depend on it to accept criteria and produce rows without
//! pulling in the whole kernel.

pub mod criteria;
pub mod row;
pub mod value;

pub use criteria::{Criteria, FindOptions, OrderDirection};
pub use row::{ColumnInfo, Row};
pub use value::Value;
