//! Cascade resolution over the relation graph.

use crate::error::Error;
use crate::session::entity::{Arena, RelationState};
use crate::session::EntityId;
use std::collections::HashSet;

/// Operation being cascaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CascadeOp {
    Persist,
    Remove,
}

/// Walks the relation graph from a root and produces the ordered set of
/// entities to additionally schedule.
///
/// Traversal is depth-first over relation proxies; a visited set keyed by
/// entity handle guards against cycles, self-references, and mutual
/// references, so each reachable entity is scheduled exactly once.
/// Uninitialized inverse-side collections are never traversed; pending
/// identifier appends on an uninitialized owning collection are.
pub(crate) struct CascadeResolver<'a> {
    arena: &'a Arena,
}

impl<'a> CascadeResolver<'a> {
    pub fn new(arena: &'a Arena) -> Self {
        Self { arena }
    }

    /// Resolve the cascade targets of `root` for `op`, excluding the root
    /// itself, in depth-first discovery order.
    pub fn resolve(&self, root: EntityId, op: CascadeOp) -> Result<Vec<EntityId>, Error> {
        let mut visited = HashSet::new();
        let mut scheduled = Vec::new();
        visited.insert(root);
        self.visit(root, op, &mut visited, &mut scheduled)?;
        Ok(scheduled)
    }

    fn visit(
        &self,
        id: EntityId,
        op: CascadeOp,
        visited: &mut HashSet<EntityId>,
        scheduled: &mut Vec<EntityId>,
    ) -> Result<(), Error> {
        let data = self.arena.get(id)?;

        for prop in data.meta.relation_properties() {
            let applies = match op {
                CascadeOp::Persist => prop.cascade_persist(),
                // Orphan-removing relations follow the removal of their
                // owner even without an explicit remove cascade.
                CascadeOp::Remove => prop.cascade_remove() || prop.orphan_removal,
            };
            if !applies {
                continue;
            }

            let targets: Vec<EntityId> = match data.relations.get(&prop.name) {
                Some(RelationState::One(reference)) => reference.get().into_iter().collect(),
                Some(RelationState::Many(collection)) => collection.items().to_vec(),
                None => Vec::new(),
            };

            for target in targets {
                if visited.insert(target) {
                    scheduled.push(target);
                    self.visit(target, op, visited, scheduled)?;
                }
            }
        }

        Ok(())
    }
}
