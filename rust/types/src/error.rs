//! Errors raised while building, decomposing, hashing and transporting ASTs.

use crate::content_id::ContentId;
use crate::datom::EntityId;

/// A program that is not a well-formed canonical AST.
///
/// Raised at decomposition, ingestion or load time, before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AstError {
    #[error("{node} node is missing field `{field}`")]
    MissingField { node: String, field: String },

    #[error("unknown node type `{tag}`")]
    UnknownTag { tag: String },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("entity {entity} has no facts")]
    UnknownEntity { entity: EntityId },

    #[error("entity {entity} references missing entity {target}")]
    DanglingReference { entity: EntityId, target: EntityId },

    #[error("reference cycle through entity {entity}")]
    CyclicReference { entity: EntityId },

    #[error("entity {entity} carries conflicting values for {attribute}")]
    ConflictingFact { entity: EntityId, attribute: String },

    #[error("entity {entity} is already defined with different facts")]
    EntityConflict { entity: EntityId },

    #[error("provisional id space exhausted (next id {next})")]
    IdSpaceExhausted { next: EntityId },

    #[error("fact set has no entities")]
    Empty,
}

impl AstError {
    pub(crate) fn missing(node: &str, field: &str) -> Self {
        AstError::MissingField {
            node: node.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        AstError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure exporting or importing a hash-addressed bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    /// A reference names a hash found neither in the bundle nor in the
    /// caller's hash map.
    #[error("unresolved content hash {hash}")]
    UnresolvedHash { hash: ContentId },

    /// A bundle entry does not digest to the hash it is filed under.
    #[error("bundle entry {expected} digests to {actual}")]
    HashMismatch {
        expected: ContentId,
        actual: ContentId,
    },

    #[error("malformed bundle entry: {0}")]
    Ast(#[from] AstError),

    #[error("bundle encoding: {0}")]
    Encoding(String),
}
