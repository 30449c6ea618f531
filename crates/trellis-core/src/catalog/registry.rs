//! Metadata registry: the validated, immutable set of entity definitions.

use super::entity::EntityMetadata;
use super::property::RelationKind;
use crate::error::Error;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<MetadataRegistry>> = OnceLock::new();

/// The process-wide registry of entity metadata.
///
/// Built once before any session is created and never mutated afterwards;
/// sessions share it by `Arc`. An optional global slot supports explicit
/// one-shot installation for applications that want ambient access.
#[derive(Debug)]
pub struct MetadataRegistry {
    entities: Vec<Arc<EntityMetadata>>,
    by_name: HashMap<String, usize>,
}

impl MetadataRegistry {
    /// Start building a registry.
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder {
            entities: Vec::new(),
        }
    }

    /// Get an entity definition by name.
    pub fn get(&self, name: &str) -> Result<&Arc<EntityMetadata>, Error> {
        self.by_name
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Check if an entity is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Iterate over entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.iter()
    }

    /// Number of declared entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Install this registry into the process-wide slot.
    ///
    /// Fails if a registry has already been installed; the global registry
    /// is loaded exactly once and lives until process exit.
    pub fn install(self) -> Result<Arc<MetadataRegistry>, Error> {
        let registry = Arc::new(self);
        GLOBAL
            .set(Arc::clone(&registry))
            .map_err(|_| Error::InvalidMetadata("a global registry is already installed".into()))?;
        Ok(registry)
    }

    /// Get the process-wide registry, if one was installed.
    pub fn global() -> Option<Arc<MetadataRegistry>> {
        GLOBAL.get().cloned()
    }
}

/// Builder for [`MetadataRegistry`].
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetadataRegistryBuilder {
    /// Add an entity definition.
    pub fn entity(mut self, entity: EntityMetadata) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate the definitions and build the registry.
    pub fn build(self) -> Result<MetadataRegistry, Error> {
        let mut by_name = HashMap::new();
        for (i, entity) in self.entities.iter().enumerate() {
            if by_name.insert(entity.name.clone(), i).is_some() {
                return Err(Error::InvalidMetadata(format!(
                    "duplicate entity '{}'",
                    entity.name
                )));
            }
        }

        for entity in &self.entities {
            Self::validate_entity(entity, &by_name, &self.entities)?;
        }

        Ok(MetadataRegistry {
            entities: self.entities.into_iter().map(Arc::new).collect(),
            by_name,
        })
    }

    fn validate_entity(
        entity: &EntityMetadata,
        by_name: &HashMap<String, usize>,
        entities: &[EntityMetadata],
    ) -> Result<(), Error> {
        let pk = entity.primary_property().ok_or_else(|| {
            Error::InvalidMetadata(format!(
                "entity '{}' declares no property '{}' for its primary key",
                entity.name, entity.primary_key
            ))
        })?;
        if pk.is_relation() {
            return Err(Error::InvalidMetadata(format!(
                "primary key '{}' of entity '{}' must be a scalar",
                pk.name, entity.name
            )));
        }

        for prop in entity.relation_properties() {
            let target_name = prop.target.as_deref().ok_or_else(|| {
                Error::InvalidMetadata(format!(
                    "relation '{}.{}' declares no target entity",
                    entity.name, prop.name
                ))
            })?;
            let target_idx = *by_name.get(target_name).ok_or_else(|| {
                Error::InvalidMetadata(format!(
                    "relation '{}.{}' targets undeclared entity '{}'",
                    entity.name, prop.name, target_name
                ))
            })?;
            let target = &entities[target_idx];

            if prop.kind == RelationKind::OneToMany && prop.inverse.is_none() {
                return Err(Error::InvalidMetadata(format!(
                    "one-to-many '{}.{}' must be mapped by a property on '{}'",
                    entity.name, prop.name, target_name
                )));
            }

            if let Some(inverse) = prop.inverse.as_deref() {
                let other = target.property(inverse).ok_or_else(|| {
                    Error::InvalidMetadata(format!(
                        "relation '{}.{}' maps to undeclared property '{}.{}'",
                        entity.name, prop.name, target_name, inverse
                    ))
                })?;
                let compatible = matches!(
                    (prop.kind, other.kind),
                    (RelationKind::OneToMany, RelationKind::ManyToOne)
                        | (RelationKind::ManyToOne, RelationKind::OneToMany)
                        | (RelationKind::ManyToMany, RelationKind::ManyToMany)
                        | (RelationKind::OneToOne, RelationKind::OneToOne)
                );
                if !compatible {
                    return Err(Error::InvalidMetadata(format!(
                        "relation '{}.{}' is paired with '{}.{}' of incompatible kind",
                        entity.name, prop.name, target_name, inverse
                    )));
                }
            }
        }

        Ok(())
    }
}
