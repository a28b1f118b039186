//! Static class-mapping model for the Canopy object-document mapper.
//!
//! Mapping drivers (attribute, XML, YAML, programmatic) are external to
//! Canopy; whatever their input format, they produce the descriptors in
//! this crate. The unit of work consumes the descriptors read-only.
//!
//! # Key Types
//!
//! - [`ClassMapping`] -- per-document-type descriptor: fields,
//!   associations, identifier strategy, node type, versioning, translator
//! - [`FieldMapping`] -- one mapped scalar/multivalue field
//! - [`AssociationMapping`] / [`AssociationKind`] -- parent, child,
//!   children, reference-one, reference-many, referrers
//! - [`Cascade`] -- per-association cascade flags
//! - [`TypeTag`] / [`TypeResolver`] -- closed-variant resolution of stored
//!   class names back to mapped types, with a generic fallback
//! - [`MappingRegistry`] -- the set of registered class mappings

pub mod assoc;
pub mod class;
pub mod error;
pub mod registry;
pub mod resolver;

pub use assoc::{AssociationKind, AssociationMapping, Cascade};
pub use class::{ClassMapping, FieldMapping, IdStrategy, Versioning};
pub use error::{MappingError, MappingResult};
pub use registry::MappingRegistry;
pub use resolver::{TypeResolver, TypeTag};
