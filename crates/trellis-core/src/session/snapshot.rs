//! Snapshots of persisted entity state.

use std::collections::BTreeMap;
use trellis_proto::Value;

/// A frozen copy of an entity's persistable field values, taken when the
/// entity became managed or after its last successful flush.
///
/// Never mutated in place; replaced wholesale. Absent fields compare equal
/// to `Null`, so reference stubs diff clean against their empty snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    fields: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field value. Only used while building; existing snapshots
    /// are replaced, not updated.
    pub fn put(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// The remembered value of a field; absent fields read as `Null`.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    /// Iterate over recorded fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v))
    }

    /// Number of recorded fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Snapshot {
            fields: iter.into_iter().collect(),
        }
    }
}
