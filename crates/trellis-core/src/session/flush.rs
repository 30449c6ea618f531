//! Flush: change-set computation, write ordering, and execution.
//!
//! Planning derives insert/update/delete change sets by diffing entities
//! against their snapshots, detects orphans, and orders writes so inserts
//! respect the foreign-key dependency graph, updates run after the inserts
//! they depend on, and deletes run children-first. Execution is strictly
//! serial through the driver; the batch is wrapped in a transaction only
//! when the driver supports one, otherwise partial failure leaves prior
//! operations committed.

use super::cascade::{CascadeOp, CascadeResolver};
use super::change_set::{ChangeSet, FieldUpdate, Operation};
use super::entity::{EntityId, EntityState, RelationState};
use super::snapshot::Snapshot;
use super::Session;
use crate::catalog::{EntityProperty, RelationKind};
use crate::error::Error;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use trellis_proto::{Criteria, Row, Value};

/// Counts of operations executed by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows inserted.
    pub inserts: usize,
    /// Rows updated.
    pub updates: usize,
    /// Rows deleted.
    pub deletes: usize,
}

impl FlushReport {
    /// Check if the flush issued no operations.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Total operations executed.
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

impl Session {
    /// Compute and execute the pending writes of this session.
    ///
    /// Entities with zero field differences produce no operation, so a
    /// second flush with no intervening mutation issues nothing.
    pub fn flush(&mut self) -> Result<FlushReport, Error> {
        self.expand_persist_cascades()?;
        self.detect_orphans()?;

        let deletes: Vec<EntityId> = self
            .remove_queue
            .iter()
            .copied()
            .filter(|id| matches!(self.arena.get(*id), Ok(d) if d.pk.is_some()))
            .collect();
        let inserts: Vec<EntityId> = self
            .persist_queue
            .iter()
            .copied()
            .filter(|id| matches!(self.arena.get(*id), Ok(d) if d.state == EntityState::New))
            .collect();

        let insert_order = self.dependency_order(&inserts)?;
        let position: HashMap<EntityId, usize> = insert_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        for id in &insert_order {
            self.apply_defaults(*id)?;
        }

        let mut insert_sets = Vec::new();
        let mut update_sets = Vec::new();
        for id in &insert_order {
            let (insert, deferred) = self.build_insert(*id, &position)?;
            insert_sets.push(insert);
            if let Some(followup) = deferred {
                update_sets.push(followup);
            }
        }

        let delete_set: HashSet<EntityId> = deletes.iter().copied().collect();
        for id in self.arena.ids() {
            let data = self.arena.get(id)?;
            if data.state != EntityState::Managed
                || !data.initialized
                || data.snapshot.is_none()
                || delete_set.contains(&id)
            {
                continue;
            }
            let fields = self.diff_update(id)?;
            if !fields.is_empty() {
                let mut change_set = ChangeSet::new(id, Operation::Update);
                change_set.fields = fields;
                update_sets.push(change_set);
            }
        }

        let delete_order = {
            let mut order = self.dependency_order(&deletes)?;
            order.reverse(); // children before parents
            order
        };
        let delete_sets: Vec<ChangeSet> = delete_order
            .iter()
            .map(|id| ChangeSet::new(*id, Operation::Delete))
            .collect();

        let mut report = FlushReport::default();
        if !(insert_sets.is_empty() && update_sets.is_empty() && delete_sets.is_empty()) {
            debug!(
                inserts = insert_sets.len(),
                updates = update_sets.len(),
                deletes = delete_sets.len(),
                "executing flush"
            );

            let wrap = self.driver.capabilities().transactions;
            if wrap {
                self.driver.begin()?;
            }
            match self.execute_sets(&insert_sets, &update_sets, &delete_sets) {
                Ok(executed) => report = executed,
                Err(error) => {
                    if wrap {
                        let _ = self.driver.rollback();
                    }
                    return Err(error);
                }
            }
            if wrap {
                self.driver.commit()?;
            }
        }

        self.settle(&delete_order)?;
        Ok(report)
    }

    /// Pick up NEW entities reachable from managed or scheduled entities
    /// over persist cascades, including ones attached after their owner was
    /// scheduled.
    fn expand_persist_cascades(&mut self) -> Result<(), Error> {
        let mut roots = Vec::new();
        for id in self.arena.ids() {
            let data = self.arena.get(id)?;
            let scheduled_new =
                data.state == EntityState::New && self.persist_queue.contains(&id);
            if data.state == EntityState::Managed || scheduled_new {
                roots.push(id);
            }
        }
        for root in roots {
            let targets = CascadeResolver::new(&self.arena).resolve(root, CascadeOp::Persist)?;
            for target in targets {
                self.schedule_persist_target(target)?;
            }
        }
        Ok(())
    }

    /// Schedule deletion of entities detached from an orphan-removing
    /// relation since the last snapshot. Members re-added before the flush
    /// are not orphans.
    fn detect_orphans(&mut self) -> Result<(), Error> {
        let mut orphans: Vec<EntityId> = Vec::new();

        for id in self.arena.ids() {
            let data = self.arena.get(id)?;
            if !data.initialized || data.snapshot.is_none() {
                continue;
            }
            if !matches!(data.state, EntityState::Managed | EntityState::Removed) {
                continue;
            }
            let meta = Arc::clone(&data.meta);
            for prop in meta.relation_properties().filter(|p| p.orphan_removal) {
                match data.relations.get(&prop.name) {
                    Some(RelationState::Many(collection)) if collection.is_initialized() => {
                        orphans.extend(collection.removed_since_snapshot());
                    }
                    Some(RelationState::One(reference))
                        if prop.is_owning() && reference.is_initialized() =>
                    {
                        let old = data
                            .snapshot
                            .as_ref()
                            .map(|s| s.get(&prop.field_name).clone())
                            .unwrap_or(Value::Null);
                        if old.is_null() {
                            continue;
                        }
                        let current = reference
                            .get()
                            .and_then(|t| self.arena.get(t).ok())
                            .and_then(|d| d.pk.clone());
                        if current.as_ref() == Some(&old) {
                            continue;
                        }
                        if let Some(target) = prop.target.as_deref() {
                            if let Some(orphan) = self.identity_map.get(target, &old) {
                                orphans.push(orphan);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for orphan in orphans {
            trace!(?orphan, "scheduling orphan removal");
            let targets = CascadeResolver::new(&self.arena).resolve(orphan, CascadeOp::Remove)?;
            self.remove_one(orphan)?;
            for target in targets {
                self.remove_one(target)?;
            }
        }
        Ok(())
    }

    /// Topological order over the many-to-one / owning-one-to-one graph
    /// restricted to `ids`, parents first; ties broken by the original
    /// scheduling order. A residual cycle falls back to scheduling order.
    fn dependency_order(&self, ids: &[EntityId]) -> Result<Vec<EntityId>, Error> {
        let set: HashSet<EntityId> = ids.iter().copied().collect();
        let order_index: HashMap<EntityId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut dependents: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        let mut in_degree: HashMap<EntityId, usize> =
            ids.iter().map(|id| (*id, 0)).collect();

        for &child in ids {
            let data = self.arena.get(child)?;
            for prop in data
                .meta
                .relation_properties()
                .filter(|p| p.kind.is_to_one() && p.is_owning())
            {
                let parent = match data.relations.get(&prop.name) {
                    Some(RelationState::One(reference)) => reference.get(),
                    _ => None,
                };
                if let Some(parent) = parent {
                    if parent != child && set.contains(&parent) {
                        dependents.entry(parent).or_default().push(child);
                        if let Some(degree) = in_degree.get_mut(&child) {
                            *degree += 1;
                        }
                    }
                }
            }
        }

        let mut ready: Vec<EntityId> = ids
            .iter()
            .copied()
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        let mut ordered = Vec::with_capacity(ids.len());
        while !ready.is_empty() {
            let mut best = 0;
            for i in 1..ready.len() {
                let a = order_index.get(&ready[i]).copied().unwrap_or(usize::MAX);
                let b = order_index.get(&ready[best]).copied().unwrap_or(usize::MAX);
                if a < b {
                    best = i;
                }
            }
            let next = ready.remove(best);
            ordered.push(next);
            if let Some(children) = dependents.get(&next).cloned() {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(&child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(child);
                        }
                    }
                }
            }
        }

        if ordered.len() != ids.len() {
            warn!("write dependency cycle, falling back to scheduling order");
            for &id in ids {
                if !ordered.contains(&id) {
                    ordered.push(id);
                }
            }
        }
        Ok(ordered)
    }

    /// Apply declared defaults to unset scalar fields of an entity about to
    /// be inserted.
    fn apply_defaults(&mut self, id: EntityId) -> Result<(), Error> {
        let meta = self.meta_of(id)?;
        let data = self.arena.get_mut(id)?;
        for prop in meta.scalar_properties() {
            if let Some(default) = &prop.default {
                if !data.values.contains_key(&prop.name) {
                    data.values.insert(prop.name.clone(), default.clone());
                }
            }
        }
        Ok(())
    }

    /// Current value of a persistent field, or `None` when the relation
    /// state cannot observe it (uninitialized and untouched), in which case
    /// the snapshot value stands.
    fn persistent_entry(
        &self,
        id: EntityId,
        prop: &EntityProperty,
    ) -> Result<Option<FieldUpdate>, Error> {
        let data = self.arena.get(id)?;
        match prop.kind {
            RelationKind::Scalar => Ok(Some(FieldUpdate::Value(
                data.values.get(&prop.name).cloned().unwrap_or(Value::Null),
            ))),
            RelationKind::ManyToOne | RelationKind::OneToOne => match data.reference(&prop.name) {
                Some(reference) if reference.is_initialized() => {
                    Ok(Some(match reference.get() {
                        None => FieldUpdate::Value(Value::Null),
                        Some(target) => match self.arena.get(target)?.pk.clone() {
                            Some(pk) => FieldUpdate::Value(pk),
                            None => FieldUpdate::Reference(target),
                        },
                    }))
                }
                _ => Ok(None),
            },
            RelationKind::ManyToMany => {
                let Some(collection) = data.collection(&prop.name) else {
                    return Ok(None);
                };
                if collection.is_initialized() {
                    Ok(Some(FieldUpdate::List(self.entry_list(collection.items())?)))
                } else if collection.items().is_empty() {
                    Ok(None)
                } else {
                    // Stored identifiers plus pending appends; writes need
                    // identifiers only, never a load.
                    let stored: Vec<Value> = data
                        .snapshot
                        .as_ref()
                        .and_then(|s| s.get(&prop.field_name).as_list().map(<[Value]>::to_vec))
                        .unwrap_or_default();
                    let mut entries: Vec<FieldUpdate> =
                        stored.iter().cloned().map(FieldUpdate::Value).collect();
                    for &item in collection.items() {
                        match self.arena.get(item)?.pk.clone() {
                            Some(pk) if stored.contains(&pk) => {}
                            Some(pk) => entries.push(FieldUpdate::Value(pk)),
                            None => entries.push(FieldUpdate::Reference(item)),
                        }
                    }
                    Ok(Some(FieldUpdate::List(entries)))
                }
            }
            RelationKind::OneToMany => Ok(None),
        }
    }

    fn entry_list(&self, items: &[EntityId]) -> Result<Vec<FieldUpdate>, Error> {
        items
            .iter()
            .map(|&item| {
                Ok(match self.arena.get(item)?.pk.clone() {
                    Some(pk) => FieldUpdate::Value(pk),
                    None => FieldUpdate::Reference(item),
                })
            })
            .collect()
    }

    /// Diff an entity's current persistable state against its snapshot.
    fn diff_update(&self, id: EntityId) -> Result<Vec<(String, FieldUpdate)>, Error> {
        let data = self.arena.get(id)?;
        let meta = Arc::clone(&data.meta);
        let Some(snapshot) = data.snapshot.as_ref() else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        for prop in meta.persistent_properties() {
            let Some(entry) = self.persistent_entry(id, prop)? else {
                continue;
            };
            let changed = match &entry {
                FieldUpdate::Value(value) => *value != *snapshot.get(&prop.field_name),
                FieldUpdate::Reference(_) => true,
                FieldUpdate::List(entries) => {
                    if entries
                        .iter()
                        .any(|e| matches!(e, FieldUpdate::Reference(_)))
                    {
                        true
                    } else {
                        let values: Vec<Value> = entries
                            .iter()
                            .filter_map(|e| match e {
                                FieldUpdate::Value(v) => Some(v.clone()),
                                _ => None,
                            })
                            .collect();
                        let old = snapshot.get(&prop.field_name);
                        // An empty list and a never-written field are the
                        // same stored state.
                        !(Value::List(values.clone()) == *old
                            || (values.is_empty() && old.is_null()))
                    }
                }
            };
            if changed {
                changes.push((prop.field_name.clone(), entry));
            }
        }
        Ok(changes)
    }

    /// Build the full-row insert for an entity, deferring fields that
    /// depend on keys assigned later in the batch to a follow-up update.
    fn build_insert(
        &self,
        id: EntityId,
        position: &HashMap<EntityId, usize>,
    ) -> Result<(ChangeSet, Option<ChangeSet>), Error> {
        let data = self.arena.get(id)?;
        let meta = Arc::clone(&data.meta);
        let my_position = position.get(&id).copied().unwrap_or(usize::MAX);

        let mut insert = ChangeSet::new(id, Operation::Insert);
        let mut deferred: Vec<(String, FieldUpdate)> = Vec::new();

        for prop in meta.persistent_properties() {
            if prop.name == meta.primary_key {
                if let Some(pk) = data.pk.clone() {
                    insert
                        .fields
                        .push((prop.field_name.clone(), FieldUpdate::Value(pk)));
                }
                continue;
            }
            let Some(entry) = self.persistent_entry(id, prop)? else {
                continue;
            };
            match entry {
                FieldUpdate::Reference(target)
                    if position.get(&target).is_some_and(|p| *p >= my_position) =>
                {
                    // Self-reference or residual cycle: insert null, patch
                    // after the whole batch of inserts.
                    insert
                        .fields
                        .push((prop.field_name.clone(), FieldUpdate::Value(Value::Null)));
                    deferred.push((prop.field_name.clone(), FieldUpdate::Reference(target)));
                }
                FieldUpdate::List(entries)
                    if entries
                        .iter()
                        .any(|e| matches!(e, FieldUpdate::Reference(_))) =>
                {
                    // Identifier lists naming entities inserted in this
                    // batch complete after all inserts.
                    deferred.push((prop.field_name.clone(), FieldUpdate::List(entries)));
                }
                entry => insert.fields.push((prop.field_name.clone(), entry)),
            }
        }

        let followup = (!deferred.is_empty()).then(|| {
            let mut change_set = ChangeSet::new(id, Operation::Update);
            change_set.fields = deferred;
            change_set
        });
        Ok((insert, followup))
    }

    /// Execute the ordered operations serially through the driver.
    fn execute_sets(
        &mut self,
        inserts: &[ChangeSet],
        updates: &[ChangeSet],
        deletes: &[ChangeSet],
    ) -> Result<FlushReport, Error> {
        let driver = Arc::clone(&self.driver);
        let mut report = FlushReport::default();

        for change_set in inserts {
            let (collection, primary_key) = {
                let data = self.arena.get(change_set.entity)?;
                (data.meta.collection.clone(), data.meta.primary_key.clone())
            };
            let row: Row = {
                let arena = &self.arena;
                change_set
                    .resolve_fields(&|eid| arena.get(eid).ok().and_then(|d| d.pk.clone()))?
                    .into_iter()
                    .collect()
            };
            trace!(collection = %collection, "insert");
            let returned = driver.insert(&collection, &row)?;

            let (name, pk) = {
                let data = self.arena.get_mut(change_set.entity)?;
                if data.pk.is_none() {
                    data.pk = Some(returned.clone());
                    data.values.insert(primary_key, returned);
                }
                let pk = data.pk.clone().ok_or_else(|| {
                    Error::Internal("insert yielded no primary key".into())
                })?;
                (data.meta.name.clone(), pk)
            };
            self.identity_map.register(&name, &pk, change_set.entity)?;
            report.inserts += 1;
        }

        for change_set in updates {
            if change_set.is_empty() {
                continue;
            }
            let (collection, pk_field, pk) = self.write_target(change_set.entity)?;
            let changes = {
                let arena = &self.arena;
                change_set
                    .resolve_fields(&|eid| arena.get(eid).ok().and_then(|d| d.pk.clone()))?
            };
            trace!(collection = %collection, fields = changes.len(), "update");
            driver.update(&collection, &Criteria::new().eq(pk_field, pk), &changes)?;
            report.updates += 1;
        }

        for change_set in deletes {
            let (collection, pk_field, pk) = self.write_target(change_set.entity)?;
            trace!(collection = %collection, "delete");
            driver.delete(&collection, &Criteria::new().eq(pk_field, pk))?;
            report.deletes += 1;
        }

        Ok(report)
    }

    fn write_target(&self, id: EntityId) -> Result<(String, String, Value), Error> {
        let data = self.arena.get(id)?;
        let pk = data
            .pk
            .clone()
            .ok_or_else(|| Error::Internal("write target has no primary key".into()))?;
        Ok((
            data.meta.collection.clone(),
            data.meta.primary_field().to_string(),
            pk,
        ))
    }

    /// Post-flush bookkeeping: unregister deleted identities, promote
    /// inserted entities to managed, replace snapshots wholesale, and clear
    /// relation dirt.
    fn settle(&mut self, deleted: &[EntityId]) -> Result<(), Error> {
        for &id in deleted {
            let (name, pk) = {
                let data = self.arena.get(id)?;
                (data.meta.name.clone(), data.pk.clone())
            };
            if let Some(pk) = pk {
                self.identity_map.unregister(&name, &pk);
            }
        }

        for id in self.arena.ids() {
            let state = self.arena.get(id)?.state;
            match state {
                EntityState::New => {
                    if self.persist_queue.contains(&id) {
                        self.arena.get_mut(id)?.state = EntityState::Managed;
                        self.refresh_snapshot(id)?;
                    }
                }
                EntityState::Managed => {
                    if self.arena.get(id)?.initialized {
                        self.refresh_snapshot(id)?;
                    }
                }
                EntityState::Removed | EntityState::Detached => {}
            }
        }

        self.persist_queue.clear();
        self.remove_queue.clear();
        Ok(())
    }

    /// Replace an entity's snapshot with its just-persisted state and mark
    /// its relation proxies clean.
    pub(crate) fn refresh_snapshot(&mut self, id: EntityId) -> Result<(), Error> {
        let meta = self.meta_of(id)?;
        let old = self.arena.get(id)?.snapshot.clone();

        let mut snapshot = Snapshot::new();
        for prop in meta.persistent_properties() {
            match self.persistent_entry(id, prop)? {
                Some(entry) => {
                    let value = {
                        let arena = &self.arena;
                        entry.resolve(&|eid| arena.get(eid).ok().and_then(|d| d.pk.clone()))?
                    };
                    snapshot.put(prop.field_name.clone(), value);
                }
                None => {
                    if let Some(old) = &old {
                        let value = old.get(&prop.field_name).clone();
                        if !value.is_null() {
                            snapshot.put(prop.field_name.clone(), value);
                        }
                    }
                }
            }
        }

        let data = self.arena.get_mut(id)?;
        data.snapshot = Some(snapshot);
        for state in data.relations.values_mut() {
            match state {
                RelationState::One(reference) => reference.mark_flushed(),
                RelationState::Many(collection) => collection.mark_flushed(),
            }
        }
        Ok(())
    }
}
