//! Per-session identity map.

use crate::error::Error;
use crate::session::EntityId;
use std::collections::HashMap;
use trellis_proto::Value;

/// Render a primary key as a stable map-key component.
pub(crate) fn key_repr(pk: &Value) -> String {
    match pk {
        Value::Int32(i) => i.to_string(),
        Value::Int64(i) => i.to_string(),
        Value::String(s) => s.clone(),
        Value::Uuid(u) => u.iter().map(|b| format!("{b:02x}")).collect(),
        Value::Timestamp(t) => t.to_string(),
        other => format!("{other:?}"),
    }
}

/// Compose the identity key for an (entity type, primary key) pair.
pub(crate) fn identity_key(entity: &str, pk: &Value) -> String {
    format!("{entity}-{}", key_repr(pk))
}

/// Maps (entity type, primary key) to the single live instance representing
/// that row within one session.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    map: HashMap<String, EntityId>,
}

impl IdentityMap {
    /// Look up the live instance for an identity.
    pub fn get(&self, entity: &str, pk: &Value) -> Option<EntityId> {
        self.map.get(&identity_key(entity, pk)).copied()
    }

    /// Register an instance under its identity. Fails if a different
    /// instance already holds it; callers check first.
    pub fn register(&mut self, entity: &str, pk: &Value, id: EntityId) -> Result<(), Error> {
        let key = identity_key(entity, pk);
        match self.map.get(&key) {
            Some(existing) if *existing != id => Err(Error::DuplicateIdentity(key)),
            _ => {
                self.map.insert(key, id);
                Ok(())
            }
        }
    }

    /// Drop an identity from the map.
    pub fn unregister(&mut self, entity: &str, pk: &Value) {
        self.map.remove(&identity_key(entity, pk));
    }

    /// Discard every identity.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Number of registered identities.
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: u32) -> EntityId {
        EntityId { slot, epoch: 0 }
    }

    #[test]
    fn test_register_and_get() {
        let mut map = IdentityMap::default();
        let pk = Value::Int64(1);

        assert!(map.get("User", &pk).is_none());
        map.register("User", &pk, id(0)).unwrap();
        assert_eq!(map.get("User", &pk), Some(id(0)));
        assert_eq!(map.len(), 1);

        // Same instance may re-register.
        map.register("User", &pk, id(0)).unwrap();
    }

    #[test]
    fn test_conflicting_instance_rejected() {
        let mut map = IdentityMap::default();
        let pk = Value::Int64(1);
        map.register("User", &pk, id(0)).unwrap();

        let result = map.register("User", &pk, id(1));
        assert!(matches!(result, Err(Error::DuplicateIdentity(_))));
    }

    #[test]
    fn test_identities_are_per_type() {
        let mut map = IdentityMap::default();
        let pk = Value::Int64(1);
        map.register("User", &pk, id(0)).unwrap();
        map.register("Post", &pk, id(1)).unwrap();

        assert_eq!(map.get("User", &pk), Some(id(0)));
        assert_eq!(map.get("Post", &pk), Some(id(1)));
    }

    #[test]
    fn test_unregister_and_clear() {
        let mut map = IdentityMap::default();
        map.register("User", &Value::Int64(1), id(0)).unwrap();
        map.register("User", &Value::Int64(2), id(1)).unwrap();

        map.unregister("User", &Value::Int64(1));
        assert!(map.get("User", &Value::Int64(1)).is_none());
        assert_eq!(map.len(), 1);

        map.clear();
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_key_repr_stability() {
        assert_eq!(identity_key("User", &Value::Int64(7)), "User-7");
        assert_eq!(identity_key("User", &Value::String("abc".into())), "User-abc");
    }
}
