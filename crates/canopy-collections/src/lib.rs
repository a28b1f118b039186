//! Lazy document collections for the Canopy object-document mapper.
//!
//! A collection starts *uninitialized*, holding only the metadata it needs
//! to load itself later (a child-name filter, referenced paths, or a
//! referring-property filter). The first content access initializes it;
//! from then on it behaves as an ordinary ordered container with a dirty
//! flag. Alongside the live content, every collection tracks an
//! "original" baseline (child keys or referenced paths) captured at load
//! time and used by change-set computation, so a collection that was
//! never initialized can still be diffed through its baseline.
//!
//! Collections are pure in-memory state. The document manager performs the
//! store I/O that feeds initialization; the cooperative, single-threaded
//! contract means no locking is involved. These types are not safe for
//! concurrent mutation from multiple threads of control.
//!
//! # Key Types
//!
//! - [`ChildrenCollection`] -- ordered, keyed child documents
//! - [`ReferenceManyCollection`] -- ordered multi-reference targets
//! - [`ReferrersCollection`] -- computed reverse references (read-mostly)
//! - [`CollectionState`] -- the shared initialization state machine

pub mod children;
pub mod references;
pub mod referrers;
pub mod state;

pub use children::ChildrenCollection;
pub use references::ReferenceManyCollection;
pub use referrers::ReferrersCollection;
pub use state::CollectionState;
