use canopy_types::{DocumentHandle, NodePath};

use crate::state::CollectionState;

/// Computed collection of documents that reference the owner.
///
/// Read-mostly: content is derived by the store's reverse-reference
/// lookup, optionally filtered by the referencing property name. The
/// original paths serve change-set diffing of the referrer set even when
/// the collection is never materialized.
#[derive(Clone, Debug)]
pub struct ReferrersCollection {
    state: CollectionState,
    items: Option<Vec<DocumentHandle>>,
    original_paths: Option<Vec<NodePath>>,
    property_filter: Option<String>,
    dirty: bool,
}

impl ReferrersCollection {
    pub fn new(property_filter: Option<String>) -> Self {
        Self {
            state: CollectionState::Uninitialized,
            items: None,
            original_paths: None,
            property_filter,
            dirty: false,
        }
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Restricting property name, if the mapping declared one.
    pub fn property_filter(&self) -> Option<&str> {
        self.property_filter.as_deref()
    }

    pub fn original_paths(&self) -> Option<&[NodePath]> {
        self.original_paths.as_deref()
    }

    /// Cache referrer paths for diffing without materializing documents.
    pub fn set_original_paths(&mut self, paths: Vec<NodePath>) {
        self.original_paths = Some(paths);
    }

    /// Enter the `Initializing` state; `false` if already under way or done.
    pub fn begin_initialize(&mut self) -> bool {
        if self.state != CollectionState::Uninitialized {
            return false;
        }
        self.state = CollectionState::Initializing;
        true
    }

    /// Install materialized referrers and capture the baseline.
    pub fn complete_initialize(
        &mut self,
        items: Vec<DocumentHandle>,
        paths: Vec<NodePath>,
    ) {
        if self.original_paths.is_none() {
            self.original_paths = Some(paths);
        }
        self.items = Some(items);
        self.state = CollectionState::FromStore;
    }

    fn content(&self) -> &Vec<DocumentHandle> {
        self.items.as_ref().expect("referrers collection not initialized")
    }

    pub fn len(&self) -> usize {
        self.content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content().is_empty()
    }

    pub fn handles(&self) -> &[DocumentHandle] {
        self.content()
    }

    pub fn contains(&self, handle: DocumentHandle) -> bool {
        self.content().contains(&handle)
    }

    /// Record a referrer added in memory (its owning reference property
    /// is what actually persists the link). Marks the collection dirty.
    pub fn add(&mut self, handle: DocumentHandle) {
        self.items
            .as_mut()
            .expect("referrers collection not initialized")
            .push(handle);
        self.dirty = true;
    }

    /// Reset the dirty flag and rebase, mirroring the children/reference
    /// snapshot contract.
    pub fn take_snapshot(&mut self, live_paths: Option<Vec<NodePath>>) {
        match live_paths {
            Some(paths) => self.original_paths = Some(paths),
            None => self.original_paths = None,
        }
        self.dirty = false;
    }

    /// Drop content so the next access recomputes the reverse lookup.
    pub fn invalidate(&mut self) {
        self.state = CollectionState::Uninitialized;
        self.items = None;
        self.original_paths = None;
        self.dirty = false;
    }
}

impl Default for ReferrersCollection {
    fn default() -> Self {
        Self::new(None)
    }
}
