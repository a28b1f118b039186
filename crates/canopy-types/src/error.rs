use thiserror::Error;

/// Errors produced by type construction and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid node name: {0}")]
    InvalidName(String),
}
