//! Change sets: the minimal write derived for one entity.

use crate::error::Error;
use crate::session::EntityId;
use trellis_proto::Value;

/// Write operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Insert a full row.
    Insert,
    /// Update changed fields only.
    Update,
    /// Delete by primary key.
    Delete,
}

/// A field value in a change set. References to session entities whose
/// primary key is assigned earlier in the same flush stay symbolic until
/// execution.
#[derive(Debug, Clone)]
pub enum FieldUpdate {
    /// A concrete value.
    Value(Value),
    /// The primary key of another session entity, resolved at execution.
    Reference(EntityId),
    /// An ordered identifier list, possibly containing pending references.
    List(Vec<FieldUpdate>),
}

impl FieldUpdate {
    /// Check whether resolution still depends on a pending key assignment.
    pub fn is_pending(&self, resolver: &impl Fn(EntityId) -> Option<Value>) -> bool {
        match self {
            FieldUpdate::Value(_) => false,
            FieldUpdate::Reference(id) => resolver(*id).is_none(),
            FieldUpdate::List(items) => items.iter().any(|i| i.is_pending(resolver)),
        }
    }

    /// Resolve to a concrete value, looking pending keys up through the
    /// resolver. Fails if a referenced entity still has no primary key.
    pub fn resolve(&self, resolver: &impl Fn(EntityId) -> Option<Value>) -> Result<Value, Error> {
        match self {
            FieldUpdate::Value(v) => Ok(v.clone()),
            FieldUpdate::Reference(id) => resolver(*id).ok_or_else(|| {
                Error::Internal("referenced entity has no primary key at write time".into())
            }),
            FieldUpdate::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|i| i.resolve(resolver))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
        }
    }
}

/// The derived write for one entity: operation kind plus an ordered field
/// mapping (full row for inserts, changed fields for updates, empty for
/// deletes).
#[derive(Debug)]
pub struct ChangeSet {
    /// The entity this write applies to.
    pub entity: EntityId,
    /// Operation kind.
    pub operation: Operation,
    /// Ordered field mapping, in property declaration order.
    pub fields: Vec<(String, FieldUpdate)>,
}

impl ChangeSet {
    /// Create a change set.
    pub fn new(entity: EntityId, operation: Operation) -> Self {
        Self {
            entity,
            operation,
            fields: Vec::new(),
        }
    }

    /// Check if an update carries no field changes.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve every field to a concrete value.
    pub fn resolve_fields(
        &self,
        resolver: &impl Fn(EntityId) -> Option<Value>,
    ) -> Result<Vec<(String, Value)>, Error> {
        self.fields
            .iter()
            .map(|(name, update)| Ok((name.clone(), update.resolve(resolver)?)))
            .collect()
    }
}
