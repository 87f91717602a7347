//! Error types for merging documents and building the type registry.

use thiserror::Error;

/// Result type for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Errors that abort a document merge. None of them are retried; the caller
/// discards the unit of work.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The root type has no metadata.
    #[error("entity metadata is not found for type {0}")]
    UnknownEntityType(String),

    /// A root or nested id does not resolve through the loader.
    #[error("entity {entity_type} with id {id} is not found")]
    NotFound { entity_type: String, id: i64 },

    /// A scalar foreign key and its nested relation object point at different rows.
    #[error(
        "entity {entity_type} has both {foreign_key} = {foreign_key_value} and {relation}.id = {relation_id}"
    )]
    Conflict {
        entity_type: String,
        foreign_key: String,
        foreign_key_value: i64,
        relation: String,
        relation_id: i64,
    },

    /// A document value has the wrong shape or type for its field.
    #[error("invalid value for {entity_type}.{field}: {reason}")]
    InvalidValue {
        entity_type: String,
        field: String,
        reason: String,
    },

    /// The loader failed for a reason other than a missing row.
    #[error("loader error: {0}")]
    Loader(#[from] anyhow::Error),
}

impl MergeError {
    pub(crate) fn invalid(entity_type: &str, field: &str, reason: impl Into<String>) -> Self {
        MergeError::InvalidValue {
            entity_type: entity_type.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors reported while assembling a [`TypeRegistry`](crate::model::TypeRegistry).
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("entity type {0} is registered twice")]
    DuplicateType(String),

    #[error("relation {entity_type}.{relation} targets unregistered type {target}")]
    UnknownTarget {
        entity_type: String,
        relation: String,
        target: String,
    },

    #[error("relation {entity_type}.{relation} is many-to-many but {target} has no composite key")]
    NotAJunction {
        entity_type: String,
        relation: String,
        target: String,
    },
}
