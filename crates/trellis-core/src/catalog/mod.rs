//! Catalog: declared entity metadata.
//!
//! The catalog describes entity shapes - properties, relation kinds, cascade
//! rules - as an immutable, statically-constructed table built once at
//! startup. Sessions and the schema engine reference it; nothing mutates it
//! after [`MetadataRegistry`] is built.

mod entity;
mod property;
mod registry;
mod types;

pub use entity::EntityMetadata;
pub use property::{Cascade, EntityProperty, RelationKind};
pub use registry::{MetadataRegistry, MetadataRegistryBuilder};
pub use types::ScalarType;
