//! Detached graphs: value copies of managed entities, and merging them
//! back into a session.
//!
//! A detached graph is arena-shaped - nodes plus index references - so
//! cyclic graphs are expressible as plain values and merge in finite time.

use super::entity::{EntityData, EntityId, EntityState, RelationState};
use super::Session;
use crate::error::Error;
use crate::relation::{Collection, Reference};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use trellis_proto::Value;

/// A relation of a detached node, referencing other nodes by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetachedRelation {
    /// To-one target, if any.
    One(Option<usize>),
    /// Ordered to-many members.
    Many(Vec<usize>),
}

/// One entity of a detached graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedNode {
    /// Entity type name.
    pub entity: String,
    /// Primary key; required for merging.
    pub pk: Option<Value>,
    /// Scalar property values.
    pub values: Vec<(String, Value)>,
    /// Relations whose state was known at detach time.
    pub relations: Vec<(String, DetachedRelation)>,
}

impl DetachedNode {
    /// Create a node for an entity with identity.
    pub fn new(entity: impl Into<String>, pk: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            pk: Some(pk.into()),
            values: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Add a scalar value.
    pub fn with_value(mut self, prop: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((prop.into(), value.into()));
        self
    }

    /// Add a relation entry.
    pub fn with_relation(mut self, prop: impl Into<String>, relation: DetachedRelation) -> Self {
        self.relations.push((prop.into(), relation));
        self
    }
}

/// A value-object copy of an entity graph, detached from any session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedGraph {
    nodes: Vec<DetachedNode>,
    root: usize,
}

impl DetachedGraph {
    /// Build a graph from nodes and the index of its root.
    pub fn new(root: usize, nodes: Vec<DetachedNode>) -> Self {
        Self { nodes, root }
    }

    /// The root node.
    pub fn root(&self) -> &DetachedNode {
        &self.nodes[self.root]
    }

    /// Index of the root node.
    pub fn root_index(&self) -> usize {
        self.root
    }

    /// All nodes, in discovery order.
    pub fn nodes(&self) -> &[DetachedNode] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn node_at(mapped: &[EntityId], index: usize) -> Result<EntityId, Error> {
    mapped
        .get(index)
        .copied()
        .ok_or_else(|| Error::Internal(format!("detached graph references missing node {index}")))
}

impl Session {
    /// Copy an entity graph out of the session as plain values, following
    /// initialized relations only.
    pub fn detach(&self, root: EntityId) -> Result<DetachedGraph, Error> {
        let mut index: HashMap<EntityId, usize> = HashMap::new();
        let mut order: Vec<EntityId> = Vec::new();
        let mut stack = vec![root];
        index.insert(root, 0);
        order.push(root);

        while let Some(id) = stack.pop() {
            let data = self.arena.get(id)?;
            for prop in data.meta.relation_properties() {
                let targets: Vec<EntityId> = match data.relations.get(&prop.name) {
                    Some(RelationState::One(reference)) if reference.is_initialized() => {
                        reference.get().into_iter().collect()
                    }
                    Some(RelationState::Many(collection)) if collection.is_initialized() => {
                        collection.items().to_vec()
                    }
                    _ => Vec::new(),
                };
                for target in targets {
                    if !index.contains_key(&target) {
                        index.insert(target, order.len());
                        order.push(target);
                        stack.push(target);
                    }
                }
            }
        }

        let mut nodes = Vec::with_capacity(order.len());
        for id in &order {
            let data = self.arena.get(*id)?;
            let mut node = DetachedNode {
                entity: data.meta.name.clone(),
                pk: data.pk.clone(),
                values: Vec::new(),
                relations: Vec::new(),
            };
            for prop in data.meta.scalar_properties() {
                if let Some(value) = data.values.get(&prop.name) {
                    node.values.push((prop.name.clone(), value.clone()));
                }
            }
            for prop in data.meta.relation_properties() {
                match data.relations.get(&prop.name) {
                    Some(RelationState::One(reference)) if reference.is_initialized() => {
                        let target = reference.get().and_then(|t| index.get(&t).copied());
                        node.relations
                            .push((prop.name.clone(), DetachedRelation::One(target)));
                    }
                    Some(RelationState::Many(collection)) if collection.is_initialized() => {
                        let members = collection
                            .items()
                            .iter()
                            .filter_map(|t| index.get(t).copied())
                            .collect();
                        node.relations
                            .push((prop.name.clone(), DetachedRelation::Many(members)));
                    }
                    _ => {}
                }
            }
            nodes.push(node);
        }

        Ok(DetachedGraph {
            nodes,
            root: 0,
        })
    }

    /// Reconstruct a managed graph from a detached one, by identity.
    ///
    /// Walks the graph depth-first: each node is looked up or created under
    /// its (type, primary key) exactly once, scalar fields are copied, and
    /// relations are rebuilt between the managed counterparts. Fails before
    /// touching anything if any node lacks a primary key.
    pub fn merge(&mut self, graph: &DetachedGraph) -> Result<EntityId, Error> {
        if graph.is_empty() {
            return Err(Error::Internal("cannot merge an empty graph".into()));
        }
        for node in graph.nodes() {
            if node.pk.is_none() {
                return Err(Error::MissingIdentity(node.entity.clone()));
            }
        }

        // First pass: materialize every identity exactly once and copy
        // scalar state.
        let mut mapped: Vec<EntityId> = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let meta = Arc::clone(self.registry.get(&node.entity)?);
            let pk = node.pk.clone().ok_or_else(|| {
                Error::MissingIdentity(node.entity.clone())
            })?;

            let id = match self.identity_map.get(&node.entity, &pk) {
                Some(existing) => existing,
                None => {
                    let id = self.arena.insert(EntityData {
                        meta: Arc::clone(&meta),
                        state: EntityState::Managed,
                        pk: Some(pk.clone()),
                        values: HashMap::new(),
                        relations: HashMap::new(),
                        snapshot: None,
                        initialized: true,
                    });
                    self.identity_map.register(&node.entity, &pk, id)?;
                    id
                }
            };

            let data = self.arena.get_mut(id)?;
            data.state = EntityState::Managed;
            data.initialized = true;
            for (prop, value) in &node.values {
                if meta.property(prop).is_none() {
                    return Err(Error::UnknownProperty(meta.name.clone(), prop.clone()));
                }
                data.values.insert(prop.clone(), value.clone());
            }
            mapped.push(id);
        }

        // Second pass: rebuild relations between the managed counterparts.
        for (i, node) in graph.nodes().iter().enumerate() {
            let id = mapped[i];
            let meta = self.meta_of(id)?;
            for (prop, relation) in &node.relations {
                let declared = meta
                    .property(prop)
                    .ok_or_else(|| Error::UnknownProperty(meta.name.clone(), prop.clone()))?;
                let state = match relation {
                    DetachedRelation::One(target) => {
                        if !declared.kind.is_to_one() {
                            return Err(Error::NotAReference(meta.name.clone(), prop.clone()));
                        }
                        let target = match target {
                            Some(t) => Some(node_at(&mapped, *t)?),
                            None => None,
                        };
                        RelationState::One(Reference::new_with(target))
                    }
                    DetachedRelation::Many(members) => {
                        if !declared.kind.is_to_many() {
                            return Err(Error::NotACollection(meta.name.clone(), prop.clone()));
                        }
                        let mut collection = Collection::new_uninitialized();
                        collection.initialize(
                            members
                                .iter()
                                .map(|m| node_at(&mapped, *m))
                                .collect::<Result<_, _>>()?,
                        );
                        RelationState::Many(collection)
                    }
                };
                self.arena.get_mut(id)?.relations.insert(prop.clone(), state);
            }
            // Relations the graph knows nothing about stay lazy.
            for prop in meta.relation_properties() {
                let known = self.arena.get(id)?.relations.contains_key(&prop.name);
                if !known {
                    let state = if prop.kind.is_to_many() {
                        RelationState::Many(Collection::new_uninitialized())
                    } else {
                        RelationState::One(Reference::new_uninitialized())
                    };
                    self.arena.get_mut(id)?.relations.insert(prop.name.clone(), state);
                }
            }
        }

        // Third pass: merged state is the last-known persisted state.
        for &id in &mapped {
            self.refresh_snapshot(id)?;
        }

        node_at(&mapped, graph.root_index())
    }
}
