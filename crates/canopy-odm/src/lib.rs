//! Unit-of-work engine for the Canopy object-document mapper.
//!
//! Canopy binds in-memory documents to nodes of a hierarchical content
//! repository and synchronizes them transactionally. This crate is the
//! core: the identity-mapped document arena, dirty checking against
//! load-time snapshots, operation scheduling with cascade traversal, and
//! the commit orchestrator that replays the queues against the backing
//! store in dependency order.
//!
//! # Key Types
//!
//! - [`DocumentManager`] -- the public session facade: find, persist,
//!   remove, move, reorder, merge, detach, refresh, commit
//! - [`Document`] -- the in-memory record bound to a node
//! - [`UnitOfWork`] -- change tracking and commit orchestration
//! - [`DocumentRegistry`] -- the arena + identity map
//! - [`ChangeSet`] -- one document's computed delta
//! - [`LifecycleEvent`] / [`EventDispatcher`] -- subscription points
//! - [`TranslationStrategy`] / [`AttributeTranslationStrategy`] --
//!   per-locale persistence of translated fields
//!
//! # Design Rules
//!
//! 1. At most one managed document per path; duplicate loads resolve to
//!    the registered instance.
//! 2. All side-tables are keyed by [`canopy_types::DocumentHandle`], an
//!    arena handle allocated at first contact.
//! 3. Validation errors surface before store I/O; a failed commit closes
//!    the manager and rolls back the transaction.
//! 4. One manager per logical session; not safe for concurrent use from
//!    multiple threads of control.

pub mod changeset;
pub mod document;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod reorder;
pub mod translation;
pub mod unit_of_work;

pub use changeset::{ChangeSet, ReorderPair};
pub use document::{Document, Reference};
pub use error::{OdmError, OdmResult};
pub use events::{EventDispatcher, LifecycleEvent};
pub use manager::DocumentManager;
pub use registry::{DocumentRegistry, OriginalData};
pub use translation::{
    AttributeTranslationStrategy, DefaultLocaleChooser, LocaleChooser, TranslationStrategy,
};
pub use unit_of_work::{UnitOfWork, UowContext, CLASS_PROPERTY, MANAGED_MIXIN, VERSIONABLE_MIXIN};
