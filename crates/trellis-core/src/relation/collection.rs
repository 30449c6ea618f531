//! To-many relation proxy.

use crate::session::EntityId;

/// Initialization state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// Members have not been loaded. Only identifier appends on the owning
    /// side of a many-to-many relation are permitted.
    Uninitialized,
    /// Members are loaded; the item list is authoritative.
    Initialized,
}

/// Lazy, ordered to-many relation state.
///
/// While uninitialized, `items` holds only pending appends; after
/// [`Collection::initialize`] it is the complete ordered member list.
/// Insertion order is the externally observable contract for many-to-many
/// collections and survives persistence.
#[derive(Debug)]
pub struct Collection {
    state: CollectionState,
    items: Vec<EntityId>,
    /// Membership as of initialization or the last flush, for orphan
    /// detection.
    snapshot: Vec<EntityId>,
    dirty: bool,
}

impl Collection {
    /// A collection whose members are not loaded (entities materialized
    /// from the store).
    pub fn new_uninitialized() -> Self {
        Self {
            state: CollectionState::Uninitialized,
            items: Vec::new(),
            snapshot: Vec::new(),
            dirty: false,
        }
    }

    /// An initialized empty collection (new entities).
    pub fn new_initialized() -> Self {
        Self {
            state: CollectionState::Initialized,
            items: Vec::new(),
            snapshot: Vec::new(),
            dirty: false,
        }
    }

    /// Check if members are loaded.
    pub fn is_initialized(&self) -> bool {
        self.state == CollectionState::Initialized
    }

    /// Check if the collection has unflushed mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current items: the member list when initialized, pending appends
    /// otherwise.
    pub fn items(&self) -> &[EntityId] {
        &self.items
    }

    /// Append an item, preserving insertion order. Adding a present item is
    /// a no-op. Returns whether the item was inserted.
    pub fn add(&mut self, id: EntityId) -> bool {
        if self.items.contains(&id) {
            return false;
        }
        self.items.push(id);
        self.dirty = true;
        true
    }

    /// Remove an item. Returns whether it was present.
    pub fn remove(&mut self, id: EntityId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| *item != id);
        let removed = self.items.len() != before;
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Replace the member list wholesale.
    pub fn set(&mut self, items: Vec<EntityId>) {
        self.items = items;
        self.dirty = true;
    }

    /// Remove every member. Returns how many were removed.
    pub fn remove_all(&mut self) -> usize {
        let count = self.items.len();
        if count > 0 {
            self.dirty = true;
        }
        self.items.clear();
        count
    }

    /// Identity membership test.
    pub fn contains(&self, id: EntityId) -> bool {
        self.items.contains(&id)
    }

    /// Transition to initialized with the loaded member list. Pending
    /// appends are kept after the loaded members, deduplicated by identity.
    /// Repeated initialization is a no-op.
    pub fn initialize(&mut self, loaded: Vec<EntityId>) {
        if self.is_initialized() {
            return;
        }
        self.snapshot = loaded.clone();
        let pending = std::mem::take(&mut self.items);
        self.items = loaded;
        for id in pending {
            if !self.items.contains(&id) {
                self.items.push(id);
            }
        }
        self.state = CollectionState::Initialized;
    }

    /// Members persisted at initialization or the last flush that are no
    /// longer present.
    pub fn removed_since_snapshot(&self) -> Vec<EntityId> {
        self.snapshot
            .iter()
            .copied()
            .filter(|id| !self.items.contains(id))
            .collect()
    }

    /// Called after a successful flush that persisted this relation.
    /// Uninitialized collections drop their pending appends: those are now
    /// part of the stored list and will come back on initialization.
    pub fn mark_flushed(&mut self) {
        self.dirty = false;
        if self.is_initialized() {
            self.snapshot = self.items.clone();
        } else {
            self.items.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: u32) -> EntityId {
        EntityId { slot, epoch: 0 }
    }

    #[test]
    fn test_add_preserves_order_and_dedupes() {
        let mut collection = Collection::new_initialized();
        assert!(collection.add(id(3)));
        assert!(collection.add(id(1)));
        assert!(collection.add(id(2)));
        assert!(!collection.add(id(1))); // idempotent per identity

        assert_eq!(collection.items(), &[id(3), id(1), id(2)]);
        assert!(collection.is_dirty());
    }

    #[test]
    fn test_remove_and_contains() {
        let mut collection = Collection::new_initialized();
        collection.add(id(1));
        collection.add(id(2));

        assert!(collection.contains(id(1)));
        assert!(collection.remove(id(1)));
        assert!(!collection.remove(id(1)));
        assert!(!collection.contains(id(1)));
        assert_eq!(collection.items(), &[id(2)]);
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let mut collection = Collection::new_uninitialized();
        collection.initialize(vec![id(1), id(2)]);

        collection.set(vec![id(3), id(4), id(5)]);
        assert_eq!(collection.items(), &[id(3), id(4), id(5)]);
        assert!(collection.is_dirty());
        assert_eq!(collection.removed_since_snapshot(), vec![id(1), id(2)]);
    }

    #[test]
    fn test_remove_all() {
        let mut collection = Collection::new_initialized();
        collection.add(id(1));
        collection.add(id(2));

        assert_eq!(collection.remove_all(), 2);
        assert!(collection.items().is_empty());
    }

    #[test]
    fn test_initialize_merges_pending_appends() {
        let mut collection = Collection::new_uninitialized();
        collection.add(id(9)); // pending append (owning m:n side)
        collection.add(id(1)); // duplicate of a loaded member

        collection.initialize(vec![id(1), id(2)]);
        assert!(collection.is_initialized());
        assert_eq!(collection.items(), &[id(1), id(2), id(9)]);

        // Repeated initialization is a no-op.
        collection.initialize(vec![id(7)]);
        assert_eq!(collection.items(), &[id(1), id(2), id(9)]);
    }

    #[test]
    fn test_dirty_lifecycle() {
        let mut collection = Collection::new_uninitialized();
        assert!(!collection.is_dirty());

        collection.initialize(vec![id(1)]);
        assert!(!collection.is_dirty()); // clean right after initialization

        collection.add(id(2));
        assert!(collection.is_dirty());

        collection.mark_flushed();
        assert!(!collection.is_dirty());
        assert_eq!(collection.items(), &[id(1), id(2)]);
    }

    #[test]
    fn test_removed_since_snapshot() {
        let mut collection = Collection::new_uninitialized();
        collection.initialize(vec![id(1), id(2), id(3)]);

        collection.remove(id(2));
        assert_eq!(collection.removed_since_snapshot(), vec![id(2)]);

        // Re-adding clears the orphan.
        collection.add(id(2));
        assert!(collection.removed_since_snapshot().is_empty());

        collection.remove(id(3));
        collection.mark_flushed();
        assert!(collection.removed_since_snapshot().is_empty());
    }

    #[test]
    fn test_flush_drops_pending_on_uninitialized() {
        let mut collection = Collection::new_uninitialized();
        collection.add(id(5));
        collection.mark_flushed();

        assert!(!collection.is_dirty());
        assert!(collection.items().is_empty());
        assert!(!collection.is_initialized());
    }
}
