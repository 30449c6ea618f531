//! Find criteria and result shaping options.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A conjunction of field equality conditions.
///
/// Matching a stored `List` field against a non-list value means membership,
/// the way document stores treat array fields. Drivers that cannot express
/// membership natively must emulate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    conditions: Vec<(String, Value)>,
}

impl Criteria {
    /// Create empty criteria (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    /// Iterate over conditions.
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.conditions.iter().map(|(f, v)| (f.as_str(), v))
    }

    /// Check if there are no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// Result shaping options for find operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Ordering specification, applied in sequence.
    pub order_by: Vec<(String, OrderDirection)>,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// Number of rows to skip.
    pub offset: Option<usize>,
}

impl FindOptions {
    /// Create default options (no ordering, no pagination).
    pub fn new() -> Self {
        Self::default()
    }

    /// Order ascending by a field.
    pub fn order_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push((field.into(), OrderDirection::Asc));
        self
    }

    /// Order descending by a field.
    pub fn order_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push((field.into(), OrderDirection::Desc));
        self
    }

    /// Limit the number of returned rows.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip a number of rows.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}
