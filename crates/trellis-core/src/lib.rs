//! Trellis core - unit-of-work persistence kernel.
//!
//! Trellis keeps in-memory object graphs consistent with a backing store:
//! each session tracks the entities it loads or creates, computes minimal
//! change sets against remembered snapshots, orders writes along
//! referential dependencies, cascades operations across cyclic relation
//! graphs, and manages lazily-initialized relation proxies. The schema
//! engine reconciles declared metadata against a live schema. Backends plug
//! in through the [`driver::Driver`] trait.

pub mod catalog;
pub mod driver;
pub mod error;
pub mod relation;
pub mod schema;
pub mod session;

pub use catalog::{
    Cascade, EntityMetadata, EntityProperty, MetadataRegistry, RelationKind, ScalarType,
};
pub use driver::{Driver, DriverCapabilities, DriverError, MemoryDriver};
pub use error::Error;
pub use relation::{Collection, Reference};
pub use schema::{
    ColumnSpec, DdlOp, FkAction, ForeignKeySpec, GenericSqlPlatform, LiveSchema, Platform,
    SchemaDiff, SchemaGenerator, SqlitePlatform,
};
pub use session::{
    ChangeSet, DetachedGraph, DetachedNode, DetachedRelation, EntityId, EntityState, FieldUpdate,
    FlushReport, Operation, Session, Snapshot,
};

/// Re-export the shared value vocabulary.
pub use trellis_proto as proto;
