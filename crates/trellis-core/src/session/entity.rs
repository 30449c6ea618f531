//! Session-scoped entity storage.
//!
//! Entities live in an arena owned by the session and are addressed by
//! [`EntityId`] handles, so graph traversal (cascades, merges) is index
//! based and cycle-safe by construction.

use crate::catalog::EntityMetadata;
use crate::relation::{Collection, Reference};
use crate::session::snapshot::Snapshot;
use crate::error::Error;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_proto::Value;

/// Handle to an entity within one session.
///
/// Handles become stale when the session is cleared; using one afterwards
/// fails instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub(crate) slot: u32,
    pub(crate) epoch: u32,
}

/// Lifecycle state of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created in this session, not yet flushed.
    New,
    /// Known to the backing store and tracked for changes.
    Managed,
    /// Scheduled for deletion (or already deleted by a flush).
    Removed,
    /// No longer tracked; the session was cleared.
    Detached,
}

/// Per-relation proxy state.
#[derive(Debug)]
pub(crate) enum RelationState {
    /// To-one reference.
    One(Reference),
    /// To-many collection.
    Many(Collection),
}

/// A live entity instance plus its session-scoped bookkeeping.
#[derive(Debug)]
pub(crate) struct EntityData {
    pub meta: Arc<EntityMetadata>,
    pub state: EntityState,
    pub pk: Option<Value>,
    pub values: HashMap<String, Value>,
    pub relations: HashMap<String, RelationState>,
    pub snapshot: Option<Snapshot>,
    /// False for reference stubs created from a bare primary key.
    pub initialized: bool,
}

impl EntityData {
    pub fn collection(&self, prop: &str) -> Option<&Collection> {
        match self.relations.get(prop) {
            Some(RelationState::Many(c)) => Some(c),
            _ => None,
        }
    }

    pub fn collection_mut(&mut self, prop: &str) -> Option<&mut Collection> {
        match self.relations.get_mut(prop) {
            Some(RelationState::Many(c)) => Some(c),
            _ => None,
        }
    }

    pub fn reference(&self, prop: &str) -> Option<&Reference> {
        match self.relations.get(prop) {
            Some(RelationState::One(r)) => Some(r),
            _ => None,
        }
    }

    pub fn reference_mut(&mut self, prop: &str) -> Option<&mut Reference> {
        match self.relations.get_mut(prop) {
            Some(RelationState::One(r)) => Some(r),
            _ => None,
        }
    }
}

/// Arena of session entities.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<EntityData>,
    epoch: u32,
}

impl Arena {
    pub fn insert(&mut self, data: EntityData) -> EntityId {
        let slot = self.slots.len() as u32;
        self.slots.push(data);
        EntityId {
            slot,
            epoch: self.epoch,
        }
    }

    pub fn get(&self, id: EntityId) -> Result<&EntityData, Error> {
        if id.epoch != self.epoch {
            return Err(Error::StaleHandle);
        }
        self.slots
            .get(id.slot as usize)
            .ok_or(Error::StaleHandle)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Result<&mut EntityData, Error> {
        if id.epoch != self.epoch {
            return Err(Error::StaleHandle);
        }
        self.slots
            .get_mut(id.slot as usize)
            .ok_or(Error::StaleHandle)
    }

    /// All live handles, in creation order.
    pub fn ids(&self) -> Vec<EntityId> {
        (0..self.slots.len() as u32)
            .map(|slot| EntityId {
                slot,
                epoch: self.epoch,
            })
            .collect()
    }

    /// Discard every entity and invalidate outstanding handles.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.epoch += 1;
    }
}
