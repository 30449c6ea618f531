//! Session: the unit-of-work orchestrator.
//!
//! A session owns the identity map, the entity arena, and the snapshot
//! store; it schedules persists and removes, drives cascade resolution and
//! change-set computation, and executes ordered writes through the driver
//! on [`Session::flush`]. Sessions are single-threaded; isolation is an
//! independent [`Session::fork`] sharing only the metadata registry.

mod cascade;
mod change_set;
mod entity;
mod flush;
mod identity_map;
mod merge;
mod snapshot;

pub use change_set::{ChangeSet, FieldUpdate, Operation};
pub use entity::{EntityId, EntityState};
pub use flush::FlushReport;
pub use merge::{DetachedGraph, DetachedNode, DetachedRelation};
pub use snapshot::Snapshot;

pub(crate) use entity::{Arena, EntityData, RelationState};

use crate::catalog::{EntityMetadata, EntityProperty, MetadataRegistry, RelationKind};
use crate::driver::Driver;
use crate::error::Error;
use crate::relation::{Collection, Reference};
use cascade::{CascadeOp, CascadeResolver};
use identity_map::IdentityMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use trellis_proto::{Criteria, FindOptions, Row, Value};

/// A unit-of-work session over one driver.
pub struct Session {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
    arena: Arena,
    identity_map: IdentityMap,
    persist_queue: Vec<EntityId>,
    remove_queue: Vec<EntityId>,
}

impl Session {
    /// Create a session over a registry and driver.
    pub fn new(registry: Arc<MetadataRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self {
            registry,
            driver,
            arena: Arena::default(),
            identity_map: IdentityMap::default(),
            persist_queue: Vec::new(),
            remove_queue: Vec::new(),
        }
    }

    /// The shared metadata registry.
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// An independent session sharing only the immutable registry and the
    /// driver handle.
    pub fn fork(&self) -> Session {
        Session::new(Arc::clone(&self.registry), Arc::clone(&self.driver))
    }

    /// Discard the identity map, snapshots, and every tracked entity.
    /// Outstanding handles become stale.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.identity_map.clear();
        self.persist_queue.clear();
        self.remove_queue.clear();
    }

    /// Number of identities currently tracked, for inspection.
    pub fn identity_map_len(&self) -> usize {
        self.identity_map.len()
    }

    /// Look up the live instance for an identity without touching the
    /// driver.
    pub fn identity(&self, entity: &str, pk: &Value) -> Option<EntityId> {
        self.identity_map.get(entity, pk)
    }

    // ---- entity lifecycle -------------------------------------------------

    /// Create a NEW entity instance with initialized-empty collections.
    pub fn create(&mut self, entity: &str) -> Result<EntityId, Error> {
        let meta = Arc::clone(self.registry.get(entity)?);
        let mut relations = HashMap::new();
        for prop in meta.relation_properties() {
            let state = if prop.kind.is_to_many() {
                RelationState::Many(Collection::new_initialized())
            } else {
                RelationState::One(Reference::new_with(None))
            };
            relations.insert(prop.name.clone(), state);
        }
        Ok(self.arena.insert(EntityData {
            meta,
            state: EntityState::New,
            pk: None,
            values: HashMap::new(),
            relations,
            snapshot: None,
            initialized: true,
        }))
    }

    /// Managed instance for a bare (type, primary key), loading nothing.
    /// Returns the existing instance if the identity is already tracked,
    /// otherwise registers an uninitialized stub that a later find
    /// populates in place.
    pub fn get_reference(&mut self, entity: &str, pk: Value) -> Result<EntityId, Error> {
        let meta = Arc::clone(self.registry.get(entity)?);
        if let Some(existing) = self.identity_map.get(entity, &pk) {
            return Ok(existing);
        }
        let mut relations = HashMap::new();
        for prop in meta.relation_properties() {
            let state = if prop.kind.is_to_many() {
                RelationState::Many(Collection::new_uninitialized())
            } else {
                RelationState::One(Reference::new_uninitialized())
            };
            relations.insert(prop.name.clone(), state);
        }
        let name = meta.name.clone();
        let id = self.arena.insert(EntityData {
            meta,
            state: EntityState::Managed,
            pk: Some(pk.clone()),
            values: HashMap::new(),
            relations,
            snapshot: Some(Snapshot::new()),
            initialized: false,
        });
        self.identity_map.register(&name, &pk, id)?;
        Ok(id)
    }

    /// Lifecycle state of an entity.
    pub fn state(&self, id: EntityId) -> Result<EntityState, Error> {
        Ok(self.arena.get(id)?.state)
    }

    /// Primary key of an entity, if assigned.
    pub fn pk(&self, id: EntityId) -> Result<Option<Value>, Error> {
        Ok(self.arena.get(id)?.pk.clone())
    }

    /// Declared entity type of an instance.
    pub fn entity_name(&self, id: EntityId) -> Result<String, Error> {
        Ok(self.arena.get(id)?.meta.name.clone())
    }

    /// Whether the instance's fields have been loaded (false for reference
    /// stubs).
    pub fn is_initialized(&self, id: EntityId) -> Result<bool, Error> {
        Ok(self.arena.get(id)?.initialized)
    }

    // ---- scalar access ----------------------------------------------------

    /// Read a scalar property; unset fields read as `Null`.
    pub fn get(&self, id: EntityId, prop: &str) -> Result<Value, Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if property.is_relation() {
            return Err(Error::NotScalar(meta.name.clone(), prop.to_string()));
        }
        Ok(self
            .arena
            .get(id)?
            .values
            .get(&property.name)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Write a scalar property. Setting the primary key is only allowed on
    /// NEW entities.
    pub fn set(&mut self, id: EntityId, prop: &str, value: impl Into<Value>) -> Result<(), Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if property.is_relation() {
            return Err(Error::NotScalar(meta.name.clone(), prop.to_string()));
        }
        let value = value.into();
        let data = self.arena.get_mut(id)?;
        if !data.initialized {
            // Writes to an unloaded stub would escape change tracking.
            return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
        }
        if property.name == meta.primary_key {
            if data.state != EntityState::New {
                return Err(Error::Internal(format!(
                    "cannot change the primary key of managed entity '{}'",
                    meta.name
                )));
            }
            data.pk = Some(value.clone());
        }
        data.values.insert(property.name, value);
        Ok(())
    }

    // ---- finding ----------------------------------------------------------

    /// Find entities matching the criteria, materializing each row through
    /// the identity map.
    pub fn find(
        &mut self,
        entity: &str,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<EntityId>, Error> {
        let meta = Arc::clone(self.registry.get(entity)?);
        let rows = self.driver.find(&meta.collection, criteria, options)?;
        rows.into_iter()
            .map(|row| self.materialize(&meta, &row))
            .collect()
    }

    /// Find at most one entity. Empty criteria fail before any I/O; no
    /// match is an explicit `None`, not an error.
    pub fn find_one(
        &mut self,
        entity: &str,
        criteria: &Criteria,
    ) -> Result<Option<EntityId>, Error> {
        if criteria.is_empty() {
            return Err(Error::EmptyCriteria);
        }
        let found = self.find(entity, criteria, &FindOptions::new().with_limit(1))?;
        Ok(found.into_iter().next())
    }

    /// Find an entity by primary key.
    pub fn find_by_pk(&mut self, entity: &str, pk: impl Into<Value>) -> Result<Option<EntityId>, Error> {
        let meta = Arc::clone(self.registry.get(entity)?);
        let field = meta.primary_field().to_string();
        self.find_one(entity, &Criteria::new().eq(field, pk.into()))
    }

    // ---- scheduling -------------------------------------------------------

    /// Schedule an entity (and its persist-cascade closure) for insertion
    /// or update. Persisting a removed entity cancels the scheduled
    /// deletion; the last operation wins.
    pub fn persist(&mut self, id: EntityId) -> Result<(), Error> {
        self.persist_root(id)?;
        let targets = CascadeResolver::new(&self.arena).resolve(id, CascadeOp::Persist)?;
        for target in targets {
            self.schedule_persist_target(target)?;
        }
        Ok(())
    }

    fn persist_root(&mut self, id: EntityId) -> Result<(), Error> {
        let state = self.arena.get(id)?.state;
        match state {
            EntityState::New => {
                if !self.persist_queue.contains(&id) {
                    self.persist_queue.push(id);
                }
            }
            EntityState::Managed => {}
            EntityState::Removed => {
                if self.remove_queue.contains(&id) {
                    // Cancel the scheduled deletion.
                    self.remove_queue.retain(|r| *r != id);
                    self.arena.get_mut(id)?.state = EntityState::Managed;
                } else {
                    // Already deleted by a previous flush; re-insert.
                    self.revive(id)?;
                }
            }
            EntityState::Detached => return Err(Error::StaleHandle),
        }
        Ok(())
    }

    /// Schedule a cascade-persist target. Unlike an explicit persist this
    /// never cancels an explicitly scheduled removal.
    pub(crate) fn schedule_persist_target(&mut self, id: EntityId) -> Result<(), Error> {
        let state = self.arena.get(id)?.state;
        match state {
            EntityState::New => {
                if !self.persist_queue.contains(&id) {
                    self.persist_queue.push(id);
                }
            }
            EntityState::Removed if !self.remove_queue.contains(&id) => self.revive(id)?,
            _ => {}
        }
        Ok(())
    }

    /// Bring a flushed-away entity back as NEW, keeping its primary key so
    /// re-insertion re-creates the same identity.
    fn revive(&mut self, id: EntityId) -> Result<(), Error> {
        let data = self.arena.get_mut(id)?;
        data.state = EntityState::New;
        data.snapshot = None;
        let name = data.meta.name.clone();
        let pk = data.pk.clone();
        if let Some(pk) = pk {
            self.identity_map.register(&name, &pk, id)?;
        }
        if !self.persist_queue.contains(&id) {
            self.persist_queue.push(id);
        }
        Ok(())
    }

    /// Schedule an entity (and its remove-cascade closure) for deletion.
    pub fn remove(&mut self, id: EntityId) -> Result<(), Error> {
        let targets = CascadeResolver::new(&self.arena).resolve(id, CascadeOp::Remove)?;
        self.remove_one(id)?;
        for target in targets {
            self.remove_one(target)?;
        }
        Ok(())
    }

    pub(crate) fn remove_one(&mut self, id: EntityId) -> Result<(), Error> {
        let state = self.arena.get(id)?.state;
        if state == EntityState::Removed {
            return Ok(());
        }
        self.arena.get_mut(id)?.state = EntityState::Removed;
        self.persist_queue.retain(|p| *p != id);
        if !self.remove_queue.contains(&id) {
            self.remove_queue.push(id);
        }
        Ok(())
    }

    // ---- to-one relations -------------------------------------------------

    /// Read a to-one relation. Fails if the reference has not been
    /// initialized (non-owning sides before their reverse lookup).
    pub fn reference(&self, id: EntityId, prop: &str) -> Result<Option<EntityId>, Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if !property.kind.is_to_one() {
            return Err(Error::NotAReference(meta.name.clone(), prop.to_string()));
        }
        let data = self.arena.get(id)?;
        let reference = data
            .reference(prop)
            .ok_or_else(|| Error::NotAReference(meta.name.clone(), prop.to_string()))?;
        if !reference.is_initialized() {
            return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
        }
        Ok(reference.get())
    }

    /// Point a to-one relation at a target, synchronizing the inverse
    /// side's in-memory proxy without a reload.
    pub fn set_reference(
        &mut self,
        id: EntityId,
        prop: &str,
        target: Option<EntityId>,
    ) -> Result<(), Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if !property.kind.is_to_one() {
            return Err(Error::NotAReference(meta.name.clone(), prop.to_string()));
        }
        if let Some(target) = target {
            self.check_target_type(&meta, &property, target)?;
        }

        let old = {
            let data = self.arena.get_mut(id)?;
            let reference = data
                .reference_mut(prop)
                .ok_or_else(|| Error::NotAReference(meta.name.clone(), prop.to_string()))?;
            reference.set(target)
        };
        if old == target {
            return Ok(());
        }

        if let Some(inverse) = property.inverse.clone() {
            match property.kind {
                RelationKind::ManyToOne => {
                    if let Some(old_parent) = old {
                        self.sync_collection_remove(old_parent, &inverse, id)?;
                    }
                    if let Some(new_parent) = target {
                        self.sync_collection_add(new_parent, &inverse, id)?;
                    }
                }
                RelationKind::OneToOne => {
                    if let Some(old_target) = old {
                        self.sync_reference_set(old_target, &inverse, None)?;
                    }
                    if let Some(new_target) = target {
                        self.sync_reference_set(new_target, &inverse, Some(id))?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Initialize a to-one relation through the driver: load the target
    /// stub on the owning side, or resolve the reverse lookup on the
    /// non-owning side. Repeated calls are no-ops.
    pub fn init_reference(&mut self, id: EntityId, prop: &str) -> Result<Option<EntityId>, Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if !property.kind.is_to_one() {
            return Err(Error::NotAReference(meta.name.clone(), prop.to_string()));
        }

        if property.is_owning() {
            // The foreign key lives on this row, so an unloaded stub must
            // be materialized before the pointer is readable.
            self.load_if_needed(id)?;
            let target = {
                let data = self.arena.get(id)?;
                data.reference(prop).and_then(Reference::get)
            };
            if let Some(target) = target {
                self.load_if_needed(target)?;
            }
            return Ok(target);
        }

        // Non-owning side: reverse lookup by the owning foreign key.
        let (is_initialized, current) = {
            let data = self.arena.get(id)?;
            let reference = data
                .reference(prop)
                .ok_or_else(|| Error::NotAReference(meta.name.clone(), prop.to_string()))?;
            (reference.is_initialized(), reference.get())
        };
        if is_initialized {
            return Ok(current);
        }

        let my_pk = self.arena.get(id)?.pk.clone();
        let found = match my_pk {
            None => None,
            Some(pk) => {
                let target_meta = Arc::clone(self.registry.get(self.target_of(&property)?)?);
                let owning_field = self.inverse_field(&meta, &property, &target_meta)?;
                let rows = self.driver.find(
                    &target_meta.collection,
                    &Criteria::new().eq(owning_field, pk),
                    &FindOptions::new().with_limit(1),
                )?;
                match rows.into_iter().next() {
                    Some(row) => Some(self.materialize(&target_meta, &row)?),
                    None => None,
                }
            }
        };
        if let Some(reference) = self.arena.get_mut(id)?.reference_mut(prop) {
            reference.initialize(found);
        }
        Ok(found)
    }

    // ---- to-many relations ------------------------------------------------

    /// Append an item to a to-many relation, preserving insertion order and
    /// synchronizing the inverse side. Only the owning side of a
    /// many-to-many accepts appends while uninitialized.
    pub fn collection_add(
        &mut self,
        id: EntityId,
        prop: &str,
        item: EntityId,
    ) -> Result<bool, Error> {
        let (meta, property) = self.require_collection(id, prop)?;
        self.check_target_type(&meta, &property, item)?;

        let owning_many_to_many = property.kind == RelationKind::ManyToMany && property.owner;
        let inserted = {
            let data = self.arena.get_mut(id)?;
            // Appends on an unloaded stub would bypass change tracking;
            // identifier appends need the owning row's snapshot.
            if !data.initialized {
                return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
            }
            let collection = data
                .collection_mut(prop)
                .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))?;
            if !collection.is_initialized() && !owning_many_to_many {
                return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
            }
            collection.add(item)
        };

        if inserted {
            if let Some(inverse) = property.inverse.clone() {
                match property.kind {
                    // Appending on the inverse side auto-sets the owning
                    // pointer, establishing bidirectional consistency now.
                    RelationKind::OneToMany => self.sync_set_owner(item, &inverse, Some(id))?,
                    RelationKind::ManyToMany => self.sync_collection_add(item, &inverse, id)?,
                    _ => {}
                }
            }
        }
        Ok(inserted)
    }

    /// Remove an item from a to-many relation, synchronizing the inverse
    /// side.
    pub fn collection_remove(
        &mut self,
        id: EntityId,
        prop: &str,
        item: EntityId,
    ) -> Result<bool, Error> {
        let (meta, property) = self.require_collection(id, prop)?;
        let removed = {
            let data = self.arena.get_mut(id)?;
            let collection = data
                .collection_mut(prop)
                .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))?;
            if !collection.is_initialized() {
                return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
            }
            collection.remove(item)
        };

        if removed {
            if let Some(inverse) = property.inverse.clone() {
                match property.kind {
                    RelationKind::OneToMany => {
                        let data = self.arena.get_mut(item)?;
                        if let Some(reference) = data.reference_mut(&inverse) {
                            if reference.get() == Some(id) {
                                reference.set(None);
                            }
                        }
                    }
                    RelationKind::ManyToMany => self.sync_collection_remove(item, &inverse, id)?,
                    _ => {}
                }
            }
        }
        Ok(removed)
    }

    /// Remove every member of a to-many relation. Returns how many were
    /// removed.
    pub fn collection_remove_all(&mut self, id: EntityId, prop: &str) -> Result<usize, Error> {
        let items = self.collection_items(id, prop)?;
        for item in &items {
            self.collection_remove(id, prop, *item)?;
        }
        Ok(items.len())
    }

    /// Identity membership test; fails while uninitialized.
    pub fn collection_contains(
        &self,
        id: EntityId,
        prop: &str,
        item: EntityId,
    ) -> Result<bool, Error> {
        let (meta, _) = self.require_collection(id, prop)?;
        let data = self.arena.get(id)?;
        let collection = data
            .collection(prop)
            .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))?;
        if !collection.is_initialized() {
            return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
        }
        Ok(collection.contains(item))
    }

    /// The ordered members; fails while uninitialized.
    pub fn collection_items(&self, id: EntityId, prop: &str) -> Result<Vec<EntityId>, Error> {
        let (meta, _) = self.require_collection(id, prop)?;
        let data = self.arena.get(id)?;
        let collection = data
            .collection(prop)
            .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))?;
        if !collection.is_initialized() {
            return Err(Error::NotInitialized(meta.name.clone(), prop.to_string()));
        }
        Ok(collection.items().to_vec())
    }

    /// The ordered member primary keys; members not yet assigned one are
    /// skipped.
    pub fn collection_identifiers(&self, id: EntityId, prop: &str) -> Result<Vec<Value>, Error> {
        let items = self.collection_items(id, prop)?;
        Ok(items
            .iter()
            .filter_map(|item| self.arena.get(*item).ok().and_then(|d| d.pk.clone()))
            .collect())
    }

    /// Whether a to-many relation has unflushed mutations.
    pub fn is_collection_dirty(&self, id: EntityId, prop: &str) -> Result<bool, Error> {
        let (meta, _) = self.require_collection(id, prop)?;
        let data = self.arena.get(id)?;
        data.collection(prop)
            .map(Collection::is_dirty)
            .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))
    }

    /// Whether a to-many relation has loaded its members.
    pub fn is_collection_initialized(&self, id: EntityId, prop: &str) -> Result<bool, Error> {
        let (meta, _) = self.require_collection(id, prop)?;
        let data = self.arena.get(id)?;
        data.collection(prop)
            .map(Collection::is_initialized)
            .ok_or_else(|| Error::NotACollection(meta.name.clone(), prop.to_string()))
    }

    /// Load a to-many relation through the driver and transition it to
    /// initialized, exactly once; repeated calls are no-ops.
    pub fn init_collection(&mut self, id: EntityId, prop: &str) -> Result<(), Error> {
        let (meta, property) = self.require_collection(id, prop)?;
        if self.is_collection_initialized(id, prop)? {
            return Ok(());
        }
        // A stub owner must be materialized first; the stored identifier
        // list lives in its row.
        self.load_if_needed(id)?;

        let target_name = self.target_of(&property)?.to_string();
        let target_meta = Arc::clone(self.registry.get(&target_name)?);

        let loaded: Vec<EntityId> = match property.kind {
            RelationKind::ManyToMany if property.owner => {
                // The stored identifier list carries the membership and its
                // order; resolving it needs no row loads.
                let stored: Vec<Value> = {
                    let data = self.arena.get(id)?;
                    data.snapshot
                        .as_ref()
                        .and_then(|s| s.get(&property.field_name).as_list().map(<[Value]>::to_vec))
                        .unwrap_or_default()
                };
                stored
                    .into_iter()
                    .map(|pk| self.get_reference(&target_name, pk))
                    .collect::<Result<_, _>>()?
            }
            RelationKind::ManyToMany | RelationKind::OneToMany => {
                let my_pk = self.arena.get(id)?.pk.clone();
                match my_pk {
                    None => Vec::new(),
                    Some(pk) => {
                        let owning_field =
                            self.inverse_field(&meta, &property, &target_meta)?;
                        self.find(
                            &target_name,
                            &Criteria::new().eq(owning_field, pk),
                            &FindOptions::new(),
                        )?
                    }
                }
            }
            _ => Vec::new(),
        };

        debug!(entity = %meta.name, relation = %prop, members = loaded.len(), "initialized collection");
        let data = self.arena.get_mut(id)?;
        if let Some(collection) = data.collection_mut(prop) {
            collection.initialize(loaded);
        }
        Ok(())
    }

    // ---- native passthrough ----------------------------------------------

    /// Insert a raw row, bypassing change tracking. Returns the key.
    pub fn native_insert(&self, entity: &str, row: &Row) -> Result<Value, Error> {
        let meta = self.registry.get(entity)?;
        Ok(self.driver.insert(&meta.collection, row)?)
    }

    /// Update raw rows, bypassing change tracking. Returns the affected
    /// count.
    pub fn native_update(
        &self,
        entity: &str,
        criteria: &Criteria,
        changes: &[(String, Value)],
    ) -> Result<usize, Error> {
        let meta = self.registry.get(entity)?;
        Ok(self.driver.update(&meta.collection, criteria, changes)?)
    }

    /// Delete raw rows, bypassing change tracking. Returns the affected
    /// count.
    pub fn native_delete(&self, entity: &str, criteria: &Criteria) -> Result<usize, Error> {
        let meta = self.registry.get(entity)?;
        Ok(self.driver.delete(&meta.collection, criteria)?)
    }

    // ---- materialization --------------------------------------------------

    /// Turn a stored row into a managed instance, going through the
    /// identity map so one identity has at most one live instance. An
    /// already-loaded instance is returned untouched; a stub is populated
    /// in place.
    fn materialize(&mut self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<EntityId, Error> {
        let pk_field = meta.primary_field();
        let pk = row.get(pk_field).cloned().ok_or_else(|| {
            Error::Internal(format!(
                "row for '{}' is missing its key field '{}'",
                meta.name, pk_field
            ))
        })?;

        let id = match self.identity_map.get(&meta.name, &pk) {
            Some(existing) => existing,
            None => {
                let id = self.arena.insert(EntityData {
                    meta: Arc::clone(meta),
                    state: EntityState::Managed,
                    pk: Some(pk.clone()),
                    values: HashMap::new(),
                    relations: HashMap::new(),
                    snapshot: None,
                    initialized: false,
                });
                self.identity_map.register(&meta.name, &pk, id)?;
                id
            }
        };

        if !self.arena.get(id)?.initialized {
            self.populate(id, meta, row)?;
        }
        Ok(id)
    }

    /// Fill an instance from a stored row: scalar values, relation proxies,
    /// and the snapshot of its persisted state.
    pub(crate) fn populate(
        &mut self,
        id: EntityId,
        meta: &Arc<EntityMetadata>,
        row: &Row,
    ) -> Result<(), Error> {
        // Resolve owning to-one targets first; this may register stubs.
        let mut to_one: Vec<(String, Option<EntityId>)> = Vec::new();
        for prop in meta
            .relation_properties()
            .filter(|p| p.kind.is_to_one() && p.is_owning())
        {
            let target_name = self.target_of(prop)?.to_string();
            let value = row.get(&prop.field_name).cloned().unwrap_or(Value::Null);
            let target = if value.is_null() {
                None
            } else {
                Some(self.get_reference(&target_name, value)?)
            };
            to_one.push((prop.name.clone(), target));
        }

        let data = self.arena.get_mut(id)?;
        for prop in meta.scalar_properties() {
            if let Some(value) = row.get(&prop.field_name) {
                data.values.insert(prop.name.clone(), value.clone());
            }
        }
        for prop in meta.relation_properties() {
            let state = if prop.kind.is_to_many() {
                RelationState::Many(Collection::new_uninitialized())
            } else if prop.is_owning() {
                let target = to_one
                    .iter()
                    .find(|(name, _)| name == &prop.name)
                    .and_then(|(_, target)| *target);
                RelationState::One(Reference::new_with(target))
            } else {
                RelationState::One(Reference::new_uninitialized())
            };
            data.relations.insert(prop.name.clone(), state);
        }

        let mut snapshot = Snapshot::new();
        for prop in meta.persistent_properties() {
            if let Some(value) = row.get(&prop.field_name) {
                snapshot.put(prop.field_name.clone(), value.clone());
            }
        }
        data.snapshot = Some(snapshot);
        data.initialized = true;
        Ok(())
    }

    /// Load a stub's row if its fields are not materialized yet.
    fn load_if_needed(&mut self, id: EntityId) -> Result<(), Error> {
        let (initialized, meta, pk) = {
            let data = self.arena.get(id)?;
            (data.initialized, Arc::clone(&data.meta), data.pk.clone())
        };
        if initialized {
            return Ok(());
        }
        let Some(pk) = pk else {
            return Ok(());
        };

        let field = meta.primary_field().to_string();
        let rows = self.driver.find(
            &meta.collection,
            &Criteria::new().eq(field, pk.clone()),
            &FindOptions::new().with_limit(1),
        )?;
        match rows.into_iter().next() {
            Some(row) => self.populate(id, &meta, &row),
            None => Err(Error::NotFound(
                meta.name.clone(),
                identity_map::key_repr(&pk),
            )),
        }
    }

    // ---- helpers ----------------------------------------------------------

    pub(crate) fn meta_of(&self, id: EntityId) -> Result<Arc<EntityMetadata>, Error> {
        Ok(Arc::clone(&self.arena.get(id)?.meta))
    }

    fn prop_of(&self, id: EntityId, prop: &str) -> Result<(Arc<EntityMetadata>, EntityProperty), Error> {
        let meta = self.meta_of(id)?;
        let property = meta
            .property(prop)
            .cloned()
            .ok_or_else(|| Error::UnknownProperty(meta.name.clone(), prop.to_string()))?;
        Ok((meta, property))
    }

    fn require_collection(
        &self,
        id: EntityId,
        prop: &str,
    ) -> Result<(Arc<EntityMetadata>, EntityProperty), Error> {
        let (meta, property) = self.prop_of(id, prop)?;
        if !property.kind.is_to_many() {
            return Err(Error::NotACollection(meta.name.clone(), prop.to_string()));
        }
        Ok((meta, property))
    }

    fn target_of<'p>(&self, property: &'p EntityProperty) -> Result<&'p str, Error> {
        property.target.as_deref().ok_or_else(|| {
            Error::InvalidMetadata(format!(
                "relation '{}' declares no target entity",
                property.name
            ))
        })
    }

    /// Storage field of the owning property on the other side of a
    /// bidirectional relation.
    fn inverse_field(
        &self,
        meta: &EntityMetadata,
        property: &EntityProperty,
        target_meta: &EntityMetadata,
    ) -> Result<String, Error> {
        let inverse = property.inverse.as_deref().ok_or_else(|| {
            Error::InvalidMetadata(format!(
                "relation '{}.{}' has no mapped property on '{}'",
                meta.name, property.name, target_meta.name
            ))
        })?;
        let owning = target_meta.property(inverse).ok_or_else(|| {
            Error::UnknownProperty(target_meta.name.clone(), inverse.to_string())
        })?;
        Ok(owning.field_name.clone())
    }

    fn check_target_type(
        &self,
        meta: &EntityMetadata,
        property: &EntityProperty,
        item: EntityId,
    ) -> Result<(), Error> {
        let item_entity = self.entity_name(item)?;
        let expected = self.target_of(property)?;
        if item_entity != expected {
            return Err(Error::InvalidMetadata(format!(
                "relation '{}.{}' expects entity '{}', got '{}'",
                meta.name, property.name, expected, item_entity
            )));
        }
        Ok(())
    }

    /// Set an owning to-one pointer directly and drop the item from its old
    /// parent's initialized collection.
    fn sync_set_owner(
        &mut self,
        item: EntityId,
        prop: &str,
        target: Option<EntityId>,
    ) -> Result<(), Error> {
        let old = {
            let data = self.arena.get_mut(item)?;
            match data.reference_mut(prop) {
                Some(reference) => reference.set(target),
                None => return Ok(()),
            }
        };
        if old == target {
            return Ok(());
        }
        if let Some(old_parent) = old {
            let item_meta = self.meta_of(item)?;
            if let Some(collection_prop) =
                item_meta.property(prop).and_then(|p| p.inverse.clone())
            {
                self.sync_collection_remove(old_parent, &collection_prop, item)?;
            }
        }
        Ok(())
    }

    /// Add to a collection proxy directly (no inverse recursion), skipping
    /// uninitialized collections.
    fn sync_collection_add(&mut self, id: EntityId, prop: &str, item: EntityId) -> Result<(), Error> {
        if let Ok(data) = self.arena.get_mut(id) {
            if let Some(collection) = data.collection_mut(prop) {
                if collection.is_initialized() {
                    collection.add(item);
                }
            }
        }
        Ok(())
    }

    /// Remove from a collection proxy directly (no inverse recursion),
    /// skipping uninitialized collections.
    fn sync_collection_remove(
        &mut self,
        id: EntityId,
        prop: &str,
        item: EntityId,
    ) -> Result<(), Error> {
        if let Ok(data) = self.arena.get_mut(id) {
            if let Some(collection) = data.collection_mut(prop) {
                if collection.is_initialized() {
                    collection.remove(item);
                }
            }
        }
        Ok(())
    }

    /// Set a to-one proxy directly (no inverse recursion).
    fn sync_reference_set(
        &mut self,
        id: EntityId,
        prop: &str,
        target: Option<EntityId>,
    ) -> Result<(), Error> {
        if let Ok(data) = self.arena.get_mut(id) {
            if let Some(reference) = data.reference_mut(prop) {
                reference.set(target);
            }
        }
        Ok(())
    }
}
