//! Property definitions for entities.

use super::types::ScalarType;
use serde::{Deserialize, Serialize};
use trellis_proto::Value;

/// Relation kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    /// Plain scalar column.
    Scalar,
    /// Foreign key to a single target (owning side).
    ManyToOne,
    /// Unique link to a single target; one side owns the stored key.
    OneToOne,
    /// Collection of targets mapped by a foreign key on the target.
    OneToMany,
    /// Collection of targets; the owning side stores the identifier list.
    ManyToMany,
}

impl RelationKind {
    /// Check if this is a scalar (non-relation) property.
    pub fn is_scalar(&self) -> bool {
        matches!(self, RelationKind::Scalar)
    }

    /// Check if this relation points at a single target.
    pub fn is_to_one(&self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOne)
    }

    /// Check if this relation points at a collection of targets.
    pub fn is_to_many(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Cascade operations declared on a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cascade {
    /// Propagate persist scheduling.
    Persist,
    /// Propagate remove scheduling.
    Remove,
    /// Propagate everything.
    All,
}

/// A property definition within an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProperty {
    /// Property name.
    pub name: String,
    /// Storage field name (defaults to the property name).
    pub field_name: String,
    /// Semantic type for scalar properties; relations derive their stored
    /// type from the target's primary key.
    pub scalar_type: Option<ScalarType>,
    /// Relation kind.
    pub kind: RelationKind,
    /// Whether this side owns the stored association.
    pub owner: bool,
    /// Declared cascade operations.
    pub cascade: Vec<Cascade>,
    /// Whether the stored field accepts nulls.
    pub nullable: bool,
    /// Whether the stored field is unique.
    pub unique: bool,
    /// Default value applied on insert when no value is set.
    pub default: Option<Value>,
    /// Length hint for string-like columns.
    pub length: Option<u32>,
    /// Target entity name for relations.
    pub target: Option<String>,
    /// Property on the target entity forming the other side of a
    /// bidirectional relation.
    pub inverse: Option<String>,
    /// Delete a target once it is detached from this relation, even
    /// without a remove cascade.
    pub orphan_removal: bool,
}

impl EntityProperty {
    fn base(name: impl Into<String>, kind: RelationKind) -> Self {
        let name = name.into();
        Self {
            field_name: name.clone(),
            name,
            scalar_type: None,
            kind,
            owner: false,
            cascade: Vec::new(),
            nullable: false,
            unique: false,
            default: None,
            length: None,
            target: None,
            inverse: None,
            orphan_removal: false,
        }
    }

    /// Create a scalar property.
    pub fn scalar(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        let mut prop = Self::base(name, RelationKind::Scalar);
        prop.scalar_type = Some(scalar_type);
        prop
    }

    /// Create a many-to-one relation (owning side by definition).
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::base(name, RelationKind::ManyToOne);
        prop.owner = true;
        prop.target = Some(target.into());
        prop.cascade = vec![Cascade::Persist];
        prop
    }

    /// Create an owning one-to-one relation.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::base(name, RelationKind::OneToOne);
        prop.owner = true;
        prop.target = Some(target.into());
        prop.cascade = vec![Cascade::Persist];
        prop
    }

    /// Create a one-to-many relation, mapped by the owning many-to-one
    /// property on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut prop = Self::base(name, RelationKind::OneToMany);
        prop.target = Some(target.into());
        prop.inverse = Some(mapped_by.into());
        prop.cascade = vec![Cascade::Persist];
        prop
    }

    /// Create an owning many-to-many relation.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::base(name, RelationKind::ManyToMany);
        prop.owner = true;
        prop.target = Some(target.into());
        prop.cascade = vec![Cascade::Persist];
        prop
    }

    /// Turn a relation into the inverse (non-owning) side, mapped by the
    /// named property on the target.
    pub fn inverse_side(mut self, mapped_by: impl Into<String>) -> Self {
        self.owner = false;
        self.inverse = Some(mapped_by.into());
        self
    }

    /// Link the owning side to its inverse property on the target.
    pub fn with_inverse(mut self, inversed_by: impl Into<String>) -> Self {
        self.inverse = Some(inversed_by.into());
        self
    }

    /// Override the storage field name.
    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }

    /// Replace the cascade set.
    pub fn with_cascade(mut self, cascade: Vec<Cascade>) -> Self {
        self.cascade = cascade;
        self
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

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Set the length hint.
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Enable orphan removal.
    pub fn with_orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    /// Check if this is a relation property.
    pub fn is_relation(&self) -> bool {
        !self.kind.is_scalar()
    }

    /// Check if persist operations cascade over this relation.
    pub fn cascade_persist(&self) -> bool {
        self.cascade
            .iter()
            .any(|c| matches!(c, Cascade::Persist | Cascade::All))
    }

    /// Check if remove operations cascade over this relation.
    pub fn cascade_remove(&self) -> bool {
        self.cascade
            .iter()
            .any(|c| matches!(c, Cascade::Remove | Cascade::All))
    }

    /// Check if this side stores the association (scalars always do).
    pub fn is_owning(&self) -> bool {
        match self.kind {
            RelationKind::Scalar | RelationKind::ManyToOne => true,
            RelationKind::OneToOne | RelationKind::ManyToMany => self.owner,
            RelationKind::OneToMany => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_builder() {
        let prop = EntityProperty::scalar("email", ScalarType::String)
            .nullable()
            .unique()
            .with_length(120);

        assert_eq!(prop.name, "email");
        assert_eq!(prop.field_name, "email");
        assert!(prop.nullable);
        assert!(prop.unique);
        assert_eq!(prop.length, Some(120));
        assert!(!prop.is_relation());
        assert!(prop.cascade.is_empty());
    }

    #[test]
    fn test_many_to_one_defaults() {
        let prop = EntityProperty::many_to_one("author", "User").with_field_name("author_id");

        assert_eq!(prop.kind, RelationKind::ManyToOne);
        assert!(prop.owner);
        assert!(prop.is_owning());
        assert_eq!(prop.target.as_deref(), Some("User"));
        assert_eq!(prop.field_name, "author_id");
        assert!(prop.cascade_persist());
        assert!(!prop.cascade_remove());
    }

    #[test]
    fn test_inverse_side() {
        let prop = EntityProperty::many_to_many("posts", "Post").inverse_side("tags");

        assert!(!prop.owner);
        assert!(!prop.is_owning());
        assert_eq!(prop.inverse.as_deref(), Some("tags"));
    }

    #[test]
    fn test_cascade_all() {
        let prop = EntityProperty::one_to_many("comments", "Comment", "post")
            .with_cascade(vec![Cascade::All])
            .with_orphan_removal();

        assert!(prop.cascade_persist());
        assert!(prop.cascade_remove());
        assert!(prop.orphan_removal);
    }
}
