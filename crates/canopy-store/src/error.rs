use canopy_types::{NodePath, TypeError};

/// Errors from node-session operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed node does not exist.
    #[error("node not found: {0}")]
    NotFound(NodePath),

    /// A node already exists at the target path.
    #[error("node already exists: {0}")]
    NodeExists(NodePath),

    /// The parent has no child with the given name.
    #[error("node {parent} has no child {name:?}")]
    NoSuchChild { parent: NodePath, name: String },

    /// Attempted to remove or move the repository root.
    #[error("the root node cannot be {0}")]
    RootImmutable(&'static str),

    /// Transaction operation without an open transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// Path or name validation failure.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Failure reported by the storage backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for session operations.
pub type StoreResult<T> = Result<T, StoreError>;
