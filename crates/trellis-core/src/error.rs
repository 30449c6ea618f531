//! Core error types.

use crate::driver::DriverError;
use thiserror::Error;

/// Core persistence kernel errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity type is not declared in the metadata registry.
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    /// Property is not declared on the entity.
    #[error("unknown property '{1}' on entity '{0}'")]
    UnknownProperty(String, String),

    /// Metadata failed validation at registry build time.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A to-many operation was attempted on a non-collection property.
    #[error("property '{1}' of entity '{0}' is not a collection")]
    NotACollection(String, String),

    /// A to-one operation was attempted on a non-reference property.
    #[error("property '{1}' of entity '{0}' is not a to-one reference")]
    NotAReference(String, String),

    /// A scalar operation was attempted on a relation property.
    #[error("property '{1}' of entity '{0}' is a relation, use the relation accessors")]
    NotScalar(String, String),

    /// A relation proxy or entity stub has not been initialized.
    #[error("'{0}.{1}' is not initialized")]
    NotInitialized(String, String),

    /// A different instance already holds this identity in the session.
    #[error("another instance is already registered under identity '{0}'")]
    DuplicateIdentity(String),

    /// Merge requires a primary key on every node of the detached graph.
    #[error("cannot merge entity '{0}' without identifier")]
    MissingIdentity(String),

    /// A find-one lookup was issued without any condition.
    #[error("cannot call find_one with empty criteria")]
    EmptyCriteria,

    /// No row exists for the given identity.
    #[error("entity '{0}' with identifier '{1}' not found")]
    NotFound(String, String),

    /// The handle refers to an entity from before the session was cleared.
    #[error("stale entity handle, the session has been cleared")]
    StaleHandle,

    /// Driver-reported error, propagated unmodified.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}
