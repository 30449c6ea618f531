//! Entity definitions.

use super::property::{EntityProperty, RelationKind};
use serde::{Deserialize, Serialize};

/// An entity definition: name, identity, storage location, and an ordered
/// set of properties. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Entity name (unique within the registry).
    pub name: String,
    /// Name of the primary-key property.
    pub primary_key: String,
    /// Storage location (table or collection) name.
    pub collection: String,
    /// Property definitions, in declaration order.
    pub properties: Vec<EntityProperty>,
}

impl EntityMetadata {
    /// Create a new entity definition. The storage location defaults to the
    /// lowercased entity name.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.to_lowercase(),
            name,
            primary_key: primary_key.into(),
            properties: Vec::new(),
        }
    }

    /// Override the storage location name.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Add a property to the entity.
    pub fn with_property(mut self, property: EntityProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// Add multiple properties.
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = EntityProperty>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Get a property by name.
    pub fn property(&self, name: &str) -> Option<&EntityProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Get the primary-key property definition.
    pub fn primary_property(&self) -> Option<&EntityProperty> {
        self.property(&self.primary_key)
    }

    /// Storage field name of the primary key.
    pub fn primary_field(&self) -> &str {
        self.primary_property()
            .map(|p| p.field_name.as_str())
            .unwrap_or(self.primary_key.as_str())
    }

    /// Iterate over relation properties.
    pub fn relation_properties(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| p.is_relation())
    }

    /// Iterate over scalar properties.
    pub fn scalar_properties(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| !p.is_relation())
    }

    /// Iterate over properties that occupy a stored field on this entity:
    /// scalars, owning to-one foreign keys, and owning many-to-many
    /// identifier lists.
    pub fn persistent_properties(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| match p.kind {
            RelationKind::Scalar | RelationKind::ManyToOne => true,
            RelationKind::OneToOne | RelationKind::ManyToMany => p.owner,
            RelationKind::OneToMany => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScalarType;

    fn post_entity() -> EntityMetadata {
        EntityMetadata::new("Post", "id")
            .with_property(EntityProperty::scalar("id", ScalarType::Int64))
            .with_property(EntityProperty::scalar("title", ScalarType::String))
            .with_property(EntityProperty::many_to_one("author", "User").with_field_name("author_id"))
            .with_property(EntityProperty::many_to_many("tags", "Tag"))
            .with_property(EntityProperty::one_to_many("comments", "Comment", "post"))
    }

    #[test]
    fn test_entity_builder() {
        let entity = post_entity();

        assert_eq!(entity.name, "Post");
        assert_eq!(entity.collection, "post");
        assert_eq!(entity.primary_key, "id");
        assert_eq!(entity.properties.len(), 5);
        assert!(entity.primary_property().is_some());
        assert_eq!(entity.primary_field(), "id");
    }

    #[test]
    fn test_property_lookup() {
        let entity = post_entity();

        assert!(entity.property("title").is_some());
        assert!(entity.property("nonexistent").is_none());
        assert_eq!(entity.relation_properties().count(), 3);
        assert_eq!(entity.scalar_properties().count(), 2);
    }

    #[test]
    fn test_persistent_properties() {
        let entity = post_entity();
        let names: Vec<_> = entity.persistent_properties().map(|p| p.name.as_str()).collect();

        // One-to-many has no stored field on this side.
        assert_eq!(names, vec!["id", "title", "author", "tags"]);
    }

    #[test]
    fn test_custom_collection() {
        let entity = EntityMetadata::new("BookTag", "id").with_collection("book-tag");
        assert_eq!(entity.collection, "book-tag");
    }
}
