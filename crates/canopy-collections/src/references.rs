use canopy_types::{DocumentHandle, NodePath};

use crate::state::CollectionState;

/// Ordered multi-reference collection.
///
/// Uninitialized, it holds the referenced paths read from the owning
/// node's multivalue property: enough to materialize the targets later
/// and enough for change-set diffing without ever materializing them.
/// Multi-reference persistence is append/remove based rather than
/// snapshot-replace, so the dirty flag is authoritative: a dirty
/// collection is written even when its value happens to equal the
/// baseline.
#[derive(Clone, Debug)]
pub struct ReferenceManyCollection {
    state: CollectionState,
    items: Option<Vec<DocumentHandle>>,
    referenced_paths: Vec<NodePath>,
    original_paths: Option<Vec<NodePath>>,
    dirty: bool,
}

impl ReferenceManyCollection {
    /// An uninitialized collection over the paths stored on the node.
    /// The stored paths double as the original baseline.
    pub fn new(referenced_paths: Vec<NodePath>) -> Self {
        Self {
            state: CollectionState::Uninitialized,
            items: None,
            original_paths: Some(referenced_paths.clone()),
            referenced_paths,
            dirty: false,
        }
    }

    /// A collection pre-populated by application code.
    pub fn from_items(items: Vec<DocumentHandle>) -> Self {
        Self {
            state: CollectionState::FromCollection,
            items: Some(items),
            referenced_paths: Vec::new(),
            original_paths: None,
            dirty: true,
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

    /// The paths this collection would load, in stored order.
    pub fn referenced_paths(&self) -> &[NodePath] {
        &self.referenced_paths
    }

    /// The diff baseline captured at load time or last snapshot.
    pub fn original_paths(&self) -> Option<&[NodePath]> {
        self.original_paths.as_deref()
    }

    /// Enter the `Initializing` state; `false` if already under way or done.
    pub fn begin_initialize(&mut self) -> bool {
        if self.state != CollectionState::Uninitialized {
            return false;
        }
        self.state = CollectionState::Initializing;
        true
    }

    /// Install the materialized targets.
    pub fn complete_initialize(&mut self, items: Vec<DocumentHandle>) {
        self.items = Some(items);
        self.state = CollectionState::FromStore;
    }

    // ---------------------------------------------------------------
    // Content access (requires initialization)
    // ---------------------------------------------------------------

    fn content(&self) -> &Vec<DocumentHandle> {
        self.items.as_ref().expect("reference collection not initialized")
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

    /// Append a target. Marks the collection dirty.
    pub fn add(&mut self, handle: DocumentHandle) {
        self.items
            .as_mut()
            .expect("reference collection not initialized")
            .push(handle);
        self.dirty = true;
    }

    /// Remove the first occurrence of a target. Marks dirty when present.
    pub fn remove(&mut self, handle: DocumentHandle) -> bool {
        let items = self
            .items
            .as_mut()
            .expect("reference collection not initialized");
        match items.iter().position(|h| *h == handle) {
            Some(index) => {
                items.remove(index);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Reset the dirty flag and rebase. The caller resolves live handles
    /// to their current paths; `None` means the collection was never
    /// initialized and the store should be asked fresh next time.
    pub fn take_snapshot(&mut self, live_paths: Option<Vec<NodePath>>) {
        match live_paths {
            Some(paths) => {
                self.referenced_paths = paths.clone();
                self.original_paths = Some(paths);
                if self.state == CollectionState::FromCollection {
                    self.state = CollectionState::FromStore;
                }
            }
            None => {
                self.original_paths = None;
            }
        }
        self.dirty = false;
    }
}

impl Default for ReferenceManyCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
