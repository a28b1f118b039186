//! Foundation types for the Canopy object-document mapper.
//!
//! Canopy binds in-memory documents to nodes of a hierarchical,
//! path-addressed content repository. This crate defines the vocabulary
//! shared by every other Canopy crate:
//!
//! - [`NodePath`] -- a validated absolute tree path, the stable document
//!   identifier
//! - [`DocumentHandle`] -- an opaque arena handle identifying a tracked
//!   in-memory document instance
//! - [`DocumentState`] -- the document lifecycle (new, managed, removed,
//!   detached)
//! - [`PropertyValue`] -- typed scalar and multivalue storage values
//!
//! # Design Rules
//!
//! 1. Paths are validated on construction and immutable afterwards.
//! 2. Handles are allocated by the document registry only; equality of
//!    handles is identity of in-memory instances.
//! 3. Property values carry their storage type; no implicit coercion.

pub mod error;
pub mod handle;
pub mod path;
pub mod state;
pub mod value;

pub use error::TypeError;
pub use handle::DocumentHandle;
pub use path::NodePath;
pub use state::DocumentState;
pub use value::PropertyValue;
