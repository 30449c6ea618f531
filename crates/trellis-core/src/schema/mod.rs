//! Schema engine: structured DDL, diffing, platforms, and generation.
//!
//! The diff engine is a pure function of (declared metadata, live schema,
//! driver capabilities); the generator wires it to a driver's introspection
//! and execution primitives.

mod diff;
mod generator;
mod ops;
mod platform;

pub use diff::{LiveSchema, SchemaDiff};
pub use generator::SchemaGenerator;
pub use ops::{ColumnSpec, DdlOp, FkAction, ForeignKeySpec};
pub use platform::{GenericSqlPlatform, Platform, SqlitePlatform};
