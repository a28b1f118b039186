use canopy_mapping::MappingError;
use canopy_store::StoreError;
use canopy_types::{DocumentHandle, NodePath, TypeError};

/// Errors from unit-of-work and document-manager operations.
///
/// Validation errors are fatal and non-retryable: they surface before any
/// store I/O for the batch that triggered them. Store errors surfacing
/// from a commit leave the manager closed; see
/// [`OdmError::ManagerClosed`].
#[derive(Debug, thiserror::Error)]
pub enum OdmError {
    /// The manager was closed, either explicitly or by a failed commit.
    #[error("document manager is closed")]
    ManagerClosed,

    /// The handle does not resolve to a tracked document.
    #[error("unknown document handle: {0}")]
    UnknownHandle(DocumentHandle),

    /// A detached document was passed to a cascading operation.
    #[error("document {0} is detached")]
    DetachedDocument(DocumentHandle),

    /// The document is not managed by this unit of work.
    #[error("document {0} is not managed")]
    NotManaged(DocumentHandle),

    /// A different document was assigned into a single-child association
    /// of a managed parent; use an explicit move instead.
    #[error("illegal child reassignment on {parent} association {association:?}; use move instead")]
    IllegalChildReassignment {
        parent: NodePath,
        association: String,
    },

    /// The identifier of a managed document was mutated in place.
    #[error("document identifier is immutable: {current} cannot become {attempted}; use move instead")]
    ImmutableIdentifier {
        current: NodePath,
        attempted: NodePath,
    },

    /// A reachable new document sits behind an association that does not
    /// cascade persist.
    #[error("association {association:?} reaches a new document but does not cascade persist")]
    CascadePersistRequired { association: String },

    /// The identifier strategy could not produce an id.
    #[error("cannot assign identifier: {0}")]
    MissingIdentifier(String),

    /// No translation strategy registered under this key.
    #[error("unknown translation strategy: {0:?}")]
    UnknownTranslationStrategy(String),

    /// A translated document needs a locale but none is bound and no
    /// locale chooser is configured.
    #[error("no locale bound and no locale chooser configured")]
    MissingLocaleChooser,

    /// Malformed argument to a public operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Mapping lookup failure.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Error from the backing store session.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Path or name validation failure.
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for unit-of-work operations.
pub type OdmResult<T> = Result<T, OdmError>;
