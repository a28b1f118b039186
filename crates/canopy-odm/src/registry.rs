use std::collections::{BTreeMap, HashMap};

use canopy_types::{DocumentHandle, DocumentState, NodePath, PropertyValue};

use crate::document::Document;
use crate::error::{OdmError, OdmResult};

/// Per-document field snapshot taken at load or after a successful flush.
///
/// The diff baseline for change-set computation. `fields` is keyed by
/// storage property, matching the flattened form the unit of work writes.
#[derive(Clone, Debug, Default)]
pub struct OriginalData {
    /// Identifier at snapshot time; identifiers are immutable outside move.
    pub id: Option<NodePath>,
    /// Node name at snapshot time (for implicit-move detection).
    pub node_name: Option<String>,
    /// Parent handle at snapshot time (for implicit-move detection).
    pub parent: Option<DocumentHandle>,
    /// Flattened property values at snapshot time.
    pub fields: BTreeMap<String, PropertyValue>,
    /// Single-child association values at snapshot time (for illegal
    /// reassignment detection).
    pub singles: BTreeMap<String, DocumentHandle>,
}

/// The document arena and identity map.
///
/// Every tracked document lives in the arena under a stable
/// [`DocumentHandle`] allocated at first contact; all side-tables (state,
/// snapshot, locale) are handle-keyed. The identity map (`by_id`)
/// guarantees at most one managed document per path: a duplicate load of
/// the same path resolves to the already-registered handle.
pub struct DocumentRegistry {
    documents: BTreeMap<DocumentHandle, Document>,
    states: BTreeMap<DocumentHandle, DocumentState>,
    by_id: HashMap<NodePath, DocumentHandle>,
    snapshots: BTreeMap<DocumentHandle, OriginalData>,
    locales: BTreeMap<DocumentHandle, String>,
    next: u64,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            documents: BTreeMap::new(),
            states: BTreeMap::new(),
            by_id: HashMap::new(),
            snapshots: BTreeMap::new(),
            locales: BTreeMap::new(),
            next: 0,
        }
    }

    /// Bring a document into the arena as `New` and hand out its handle.
    pub fn allocate(&mut self, document: Document) -> DocumentHandle {
        let handle = DocumentHandle::from_raw(self.next);
        self.next += 1;
        self.documents.insert(handle, document);
        self.states.insert(handle, DocumentState::New);
        handle
    }

    /// Number of documents in the arena, in any state.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, handle: DocumentHandle) -> Option<&Document> {
        self.documents.get(&handle)
    }

    pub fn document_mut(&mut self, handle: DocumentHandle) -> Option<&mut Document> {
        self.documents.get_mut(&handle)
    }

    pub fn state(&self, handle: DocumentHandle) -> Option<DocumentState> {
        self.states.get(&handle).copied()
    }

    pub fn set_state(&mut self, handle: DocumentHandle, state: DocumentState) {
        if self.documents.contains_key(&handle) {
            self.states.insert(handle, state);
        }
    }

    /// Bind an identifier to a document and mark it managed. Idempotent
    /// when re-registering the same handle under the same id; registering
    /// a second instance under a managed id is rejected to preserve
    /// identity-map uniqueness.
    pub fn register_id(&mut self, handle: DocumentHandle, id: NodePath) -> OdmResult<()> {
        if let Some(existing) = self.by_id.get(&id) {
            if *existing == handle {
                return Ok(());
            }
            return Err(OdmError::InvalidArgument(format!(
                "a managed document already exists at {id}"
            )));
        }
        let document = self
            .documents
            .get_mut(&handle)
            .ok_or(OdmError::UnknownHandle(handle))?;
        document.id = Some(id.clone());
        if document.node_name.is_none() {
            document.node_name = Some(id.name().to_string());
        }
        self.by_id.insert(id, handle);
        self.states.insert(handle, DocumentState::Managed);
        Ok(())
    }

    /// Resolve a path through the identity map.
    pub fn lookup(&self, id: &NodePath) -> Option<DocumentHandle> {
        self.by_id.get(id).copied()
    }

    /// Tracked and not scheduled for removal.
    pub fn contains(&self, handle: DocumentHandle) -> bool {
        matches!(self.state(handle), Some(DocumentState::Managed))
    }

    /// Handles of all managed documents, in allocation order.
    pub fn managed_handles(&self) -> Vec<DocumentHandle> {
        self.states
            .iter()
            .filter(|(_, s)| s.is_managed())
            .map(|(h, _)| *h)
            .collect()
    }

    /// Loaded documents whose id lies strictly below `prefix`.
    pub fn descendants_of(&self, prefix: &NodePath) -> Vec<DocumentHandle> {
        self.by_id
            .iter()
            .filter(|(id, _)| prefix.is_ancestor_of(id))
            .map(|(_, h)| *h)
            .collect()
    }

    /// Rewrite the identifier of an already-registered document.
    pub fn rebind_id(&mut self, handle: DocumentHandle, new_id: NodePath) -> OdmResult<()> {
        let document = self
            .documents
            .get_mut(&handle)
            .ok_or(OdmError::UnknownHandle(handle))?;
        if let Some(old) = document.id.take() {
            self.by_id.remove(&old);
        }
        document.node_name = Some(new_id.name().to_string());
        document.id = Some(new_id.clone());
        self.by_id.insert(new_id, handle);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Snapshots and locale state
    // ---------------------------------------------------------------

    pub fn snapshot(&self, handle: DocumentHandle) -> Option<&OriginalData> {
        self.snapshots.get(&handle)
    }

    pub fn set_snapshot(&mut self, handle: DocumentHandle, snapshot: OriginalData) {
        self.snapshots.insert(handle, snapshot);
    }

    pub fn locale(&self, handle: DocumentHandle) -> Option<&str> {
        self.locales.get(&handle).map(String::as_str)
    }

    pub fn set_locale(&mut self, handle: DocumentHandle, locale: impl Into<String>) {
        self.locales.insert(handle, locale.into());
    }

    // ---------------------------------------------------------------
    // Leaving the unit of work
    // ---------------------------------------------------------------

    /// Detach: drop identity-map entry, snapshot, and locale state, keep
    /// the instance in the arena so later cascades can reject it.
    pub fn detach(&mut self, handle: DocumentHandle) {
        if let Some(document) = self.documents.get(&handle) {
            if let Some(id) = &document.id {
                self.by_id.remove(id);
            }
        }
        self.snapshots.remove(&handle);
        self.locales.remove(&handle);
        if self.documents.contains_key(&handle) {
            self.states.insert(handle, DocumentState::Detached);
        }
    }

    /// Remove every trace of a document from the arena. Called exactly
    /// once per removed document after a successful commit, and for all
    /// documents on clear.
    pub fn purge(&mut self, handle: DocumentHandle) {
        if let Some(document) = self.documents.remove(&handle) {
            if let Some(id) = &document.id {
                self.by_id.remove(id);
            }
        }
        self.states.remove(&handle);
        self.snapshots.remove(&handle);
        self.locales.remove(&handle);
    }

    /// Forget everything. Handles allocated before the clear no longer
    /// resolve.
    pub fn clear(&mut self) {
        self.documents.clear();
        self.states.clear();
        self.by_id.clear();
        self.snapshots.clear();
        self.locales.clear();
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("documents", &self.documents.len())
            .field("identified", &self.by_id.len())
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}
