//! To-one relation proxy.

use crate::session::EntityId;

/// To-one relation state. The target may be a stub whose fields are not
/// loaded yet; entity-level initialization is tracked on the target itself.
#[derive(Debug)]
pub struct Reference {
    initialized: bool,
    target: Option<EntityId>,
    dirty: bool,
}

impl Reference {
    /// A reference whose target is not known yet (non-owning one-to-one
    /// sides, resolved by a reverse lookup on first use).
    pub fn new_uninitialized() -> Self {
        Self {
            initialized: false,
            target: None,
            dirty: false,
        }
    }

    /// A reference with a known target (possibly none).
    pub fn new_with(target: Option<EntityId>) -> Self {
        Self {
            initialized: true,
            target,
            dirty: false,
        }
    }

    /// Check if the target identity is known.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Check if the reference has unflushed mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The current target, if known.
    pub fn get(&self) -> Option<EntityId> {
        self.target
    }

    /// Point at a new target. Returns the previous target.
    pub fn set(&mut self, target: Option<EntityId>) -> Option<EntityId> {
        let previous = self.target;
        if previous != target {
            self.dirty = true;
        }
        self.target = target;
        self.initialized = true;
        previous
    }

    /// Resolve an uninitialized reference with its loaded target. Repeated
    /// initialization is a no-op.
    pub fn initialize(&mut self, target: Option<EntityId>) {
        if self.initialized {
            return;
        }
        self.target = target;
        self.initialized = true;
    }

    /// Called after a successful flush that persisted this relation.
    pub fn mark_flushed(&mut self) {
        self.dirty = false;
    }
}
