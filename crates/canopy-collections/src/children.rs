use indexmap::IndexMap;

use canopy_types::DocumentHandle;

use crate::state::CollectionState;

/// Ordered, keyed collection of child documents.
///
/// While uninitialized, the collection can still answer `count`,
/// `contains_key`, and positional `slice` queries from a cheap cached
/// listing of the original child names (fetched once by the manager)
/// without materializing any child document. The original names double as
/// the change-set baseline: live keys are diffed against them to derive
/// child insertions, removals, and reorderings.
#[derive(Clone, Debug)]
pub struct ChildrenCollection {
    state: CollectionState,
    items: Option<IndexMap<String, DocumentHandle>>,
    original_names: Option<Vec<String>>,
    filter: Option<String>,
    dirty: bool,
}

impl ChildrenCollection {
    /// An uninitialized collection that will load children whose names
    /// match `filter` (prefix match; `None` loads all).
    pub fn new(filter: Option<String>) -> Self {
        Self {
            state: CollectionState::Uninitialized,
            items: None,
            original_names: None,
            filter,
            dirty: false,
        }
    }

    /// A collection pre-populated by application code; it has no store
    /// baseline until the next flush snapshot.
    pub fn from_items(items: IndexMap<String, DocumentHandle>) -> Self {
        Self {
            state: CollectionState::FromCollection,
            items: Some(items),
            original_names: None,
            filter: None,
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

    /// The child-name filter this collection was mapped with.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    // ---------------------------------------------------------------
    // Initialization protocol (driven by the manager)
    // ---------------------------------------------------------------

    /// Enter the `Initializing` state. Returns `false` if the collection
    /// is already initialized or mid-load, in which case the caller must
    /// not load again.
    pub fn begin_initialize(&mut self) -> bool {
        if self.state != CollectionState::Uninitialized {
            return false;
        }
        self.state = CollectionState::Initializing;
        true
    }

    /// Install content materialized from the store. Captures the original
    /// key order as the diff baseline unless one was already cached.
    pub fn complete_initialize(&mut self, items: IndexMap<String, DocumentHandle>) {
        if self.original_names.is_none() {
            self.original_names = Some(items.keys().cloned().collect());
        }
        self.items = Some(items);
        self.state = CollectionState::FromStore;
    }

    /// Cache the cheap child-name listing without materializing children.
    pub fn set_original_names(&mut self, names: Vec<String>) {
        self.original_names = Some(names);
    }

    /// The diff baseline: child keys as of load time (or the last
    /// snapshot). `None` if never fetched.
    pub fn original_names(&self) -> Option<&[String]> {
        self.original_names.as_deref()
    }

    // ---------------------------------------------------------------
    // Cheap queries answerable before initialization
    // ---------------------------------------------------------------

    /// Number of children. Uses live keys when initialized, otherwise the
    /// cached listing. `None` means the listing has not been fetched.
    pub fn count_hint(&self) -> Option<usize> {
        match &self.items {
            Some(items) => Some(items.len()),
            None => self.original_names.as_ref().map(|names| names.len()),
        }
    }

    /// Key membership without forcing materialization.
    pub fn contains_key_hint(&self, key: &str) -> Option<bool> {
        match &self.items {
            Some(items) => Some(items.contains_key(key)),
            None => self
                .original_names
                .as_ref()
                .map(|names| names.iter().any(|n| n == key)),
        }
    }

    /// A positional window of child keys, for pagination checks before
    /// paying the cost of loading every child.
    pub fn slice_hint(&self, offset: usize, len: usize) -> Option<Vec<String>> {
        let keys: Vec<String> = match &self.items {
            Some(items) => items.keys().cloned().collect(),
            None => self.original_names.clone()?,
        };
        Some(keys.into_iter().skip(offset).take(len).collect())
    }

    // ---------------------------------------------------------------
    // Content access (requires initialization)
    // ---------------------------------------------------------------

    fn content(&self) -> &IndexMap<String, DocumentHandle> {
        self.items.as_ref().expect("children collection not initialized")
    }

    pub fn len(&self) -> usize {
        self.content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content().is_empty()
    }

    /// Live child keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.content().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<DocumentHandle> {
        self.content().get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.content().contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, DocumentHandle)> {
        self.content().iter().map(|(k, v)| (k, *v))
    }

    /// Insert or replace a child. Marks the collection dirty.
    pub fn insert(&mut self, key: impl Into<String>, handle: DocumentHandle) {
        self.items
            .as_mut()
            .expect("children collection not initialized")
            .insert(key.into(), handle);
        self.dirty = true;
    }

    /// Remove a child by key. Marks the collection dirty when present.
    ///
    /// Order-preserving: the relative order of the remaining children is
    /// unchanged.
    pub fn remove(&mut self, key: &str) -> Option<DocumentHandle> {
        let removed = self
            .items
            .as_mut()
            .expect("children collection not initialized")
            .shift_remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Reposition `key` before `before` (or last when `None`) in the live
    /// order. Marks the collection dirty.
    pub fn move_before(&mut self, key: &str, before: Option<&str>) -> bool {
        let items = self
            .items
            .as_mut()
            .expect("children collection not initialized");
        let Some(handle) = items.shift_remove(key) else {
            return false;
        };
        match before {
            Some(target) => {
                let Some(index) = items.get_index_of(target) else {
                    // Put the entry back where we can; the caller named a
                    // nonexistent sibling.
                    items.insert(key.to_string(), handle);
                    return false;
                };
                items.shift_insert(index, key.to_string(), handle);
            }
            None => {
                items.insert(key.to_string(), handle);
            }
        }
        self.dirty = true;
        true
    }

    // ---------------------------------------------------------------
    // Snapshot / invalidation
    // ---------------------------------------------------------------

    /// Reset the dirty flag and recompute the baseline from live content.
    /// A never-initialized collection cannot have changed, so its baseline
    /// is cleared and the store is asked fresh next time.
    pub fn take_snapshot(&mut self) {
        match &self.items {
            Some(items) => {
                self.original_names = Some(items.keys().cloned().collect());
                if self.state == CollectionState::FromCollection {
                    self.state = CollectionState::FromStore;
                }
            }
            None => {
                self.original_names = None;
            }
        }
        self.dirty = false;
    }

    /// Drop content and baseline so the next access re-fetches from the
    /// store. Used after a reorder is applied to the backing node.
    pub fn invalidate(&mut self) {
        self.state = CollectionState::Uninitialized;
        self.items = None;
        self.original_names = None;
        self.dirty = false;
    }
}

impl Default for ChildrenCollection {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u64) -> DocumentHandle {
        DocumentHandle::from_raw(raw)
    }

    fn loaded(keys: &[&str]) -> ChildrenCollection {
        let mut collection = ChildrenCollection::new(None);
        assert!(collection.begin_initialize());
        let items = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), h(i as u64)))
            .collect();
        collection.complete_initialize(items);
        collection
    }

    #[test]
    fn new_collection_is_uninitialized() {
        let collection = ChildrenCollection::new(Some("post-".into()));
        assert_eq!(collection.state(), CollectionState::Uninitialized);
        assert!(!collection.is_initialized());
        assert_eq!(collection.filter(), Some("post-"));
        assert!(collection.count_hint().is_none());
    }

    #[test]
    fn initialize_captures_baseline() {
        let collection = loaded(&["a", "b"]);
        assert_eq!(collection.state(), CollectionState::FromStore);
        assert_eq!(collection.original_names().unwrap(), ["a", "b"]);
        assert_eq!(collection.keys(), ["a", "b"]);
    }

    #[test]
    fn begin_initialize_only_once() {
        let mut collection = ChildrenCollection::new(None);
        assert!(collection.begin_initialize());
        assert!(!collection.begin_initialize());
    }

    #[test]
    fn hints_from_cached_listing() {
        let mut collection = ChildrenCollection::new(None);
        collection.set_original_names(vec!["a".into(), "b".into(), "c".into()]);
        assert!(!collection.is_initialized());
        assert_eq!(collection.count_hint(), Some(3));
        assert_eq!(collection.contains_key_hint("b"), Some(true));
        assert_eq!(collection.contains_key_hint("z"), Some(false));
        assert_eq!(collection.slice_hint(1, 2).unwrap(), ["b", "c"]);
    }

    #[test]
    fn hints_prefer_live_content() {
        let mut collection = loaded(&["a", "b"]);
        collection.insert("c", h(9));
        assert_eq!(collection.count_hint(), Some(3));
        assert_eq!(collection.contains_key_hint("c"), Some(true));
        // Baseline is unchanged by live mutation.
        assert_eq!(collection.original_names().unwrap(), ["a", "b"]);
    }

    #[test]
    fn mutation_sets_dirty() {
        let mut collection = loaded(&["a"]);
        assert!(!collection.is_dirty());
        collection.insert("b", h(5));
        assert!(collection.is_dirty());
    }

    #[test]
    fn remove_preserves_order() {
        let mut collection = loaded(&["a", "b", "c"]);
        assert!(collection.remove("b").is_some());
        assert_eq!(collection.keys(), ["a", "c"]);
        assert!(collection.remove("zz").is_none());
    }

    #[test]
    fn move_before_repositions() {
        let mut collection = loaded(&["a", "b", "c"]);
        assert!(collection.move_before("c", Some("a")));
        assert_eq!(collection.keys(), ["c", "a", "b"]);
        assert!(collection.move_before("c", None));
        assert_eq!(collection.keys(), ["a", "b", "c"]);
        assert!(!collection.move_before("missing", None));
    }

    #[test]
    fn snapshot_rebases_when_initialized() {
        let mut collection = loaded(&["a", "b"]);
        collection.insert("c", h(7));
        collection.take_snapshot();
        assert!(!collection.is_dirty());
        assert_eq!(collection.original_names().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn snapshot_clears_baseline_when_uninitialized() {
        let mut collection = ChildrenCollection::new(None);
        collection.set_original_names(vec!["stale".into()]);
        collection.take_snapshot();
        assert!(collection.original_names().is_none());
    }

    #[test]
    fn from_items_is_dirty_without_baseline() {
        let mut items = IndexMap::new();
        items.insert("a".to_string(), h(1));
        let collection = ChildrenCollection::from_items(items);
        assert_eq!(collection.state(), CollectionState::FromCollection);
        assert!(collection.is_dirty());
        assert!(collection.original_names().is_none());
    }

    #[test]
    fn invalidate_resets_everything() {
        let mut collection = loaded(&["a"]);
        collection.invalidate();
        assert_eq!(collection.state(), CollectionState::Uninitialized);
        assert!(collection.count_hint().is_none());
        assert!(collection.begin_initialize());
    }
}
