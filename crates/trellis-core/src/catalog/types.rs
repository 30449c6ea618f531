//! Semantic type definitions for the catalog.

use serde::{Deserialize, Serialize};

/// Semantic scalar types supported by Trellis.
///
/// Platforms map these to backend storage types; the kernel itself only
/// cares about them for schema derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    String,
    /// Binary data.
    Bytes,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
}

impl ScalarType {
    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarType::Int32 | ScalarType::Int64 | ScalarType::Float64
        )
    }

    /// Check if this type is a string-like type.
    pub fn is_string_like(&self) -> bool {
        matches!(self, ScalarType::String | ScalarType::Bytes)
    }
}
