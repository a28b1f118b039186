//! Backing-store session boundary for the Canopy object-document mapper.
//!
//! Canopy synchronizes documents against a hierarchical, path-addressed
//! node store. This crate defines the narrow interface the unit of work
//! consumes and an in-memory reference backend:
//!
//! - [`Node`] -- a snapshot of one stored node: primary type, mixins,
//!   ordered child names, typed properties
//! - [`NodeSession`] -- the session trait: node CRUD, move, reorder,
//!   property access, child enumeration, referrer lookup, optional
//!   transactions, save/refresh
//! - [`InMemoryNodeSession`] -- `BTreeMap`-backed tree for tests and
//!   embedding, with snapshot-based transaction rollback
//!
//! # Design Rules
//!
//! 1. Absence is `Ok(None)`, never an error, on the lookup paths.
//! 2. Mutations are visible to subsequent reads in the same session
//!    immediately; `save` is the durability boundary.
//! 3. Transactions are an optional capability; callers treat "unsupported"
//!    as a no-op, not a failure.

pub mod error;
pub mod memory;
pub mod node;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryNodeSession;
pub use node::Node;
pub use traits::NodeSession;
