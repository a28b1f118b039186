use thiserror::Error;

use crate::resolver::TypeTag;

/// Errors from mapping registration and lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    /// No class mapping registered under this tag.
    #[error("unknown document class: {0}")]
    UnknownClass(TypeTag),

    /// A mapping for this tag is already registered.
    #[error("duplicate document class: {0}")]
    DuplicateClass(TypeTag),

    /// The class has no field mapped under this name.
    #[error("class {class} has no mapped field {field:?}")]
    UnknownField { class: TypeTag, field: String },

    /// The class has no association mapped under this name.
    #[error("class {class} has no mapped association {association:?}")]
    UnknownAssociation { class: TypeTag, association: String },
}

/// Result alias for mapping operations.
pub type MappingResult<T> = Result<T, MappingError>;
