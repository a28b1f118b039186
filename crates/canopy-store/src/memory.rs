use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::debug;

use canopy_types::{NodePath, PropertyValue};

use crate::error::{StoreError, StoreResult};
use crate::node::Node;
use crate::traits::NodeSession;

/// Stored form of one node; the path lives in the map key.
#[derive(Clone, Debug, PartialEq)]
struct NodeRecord {
    node_type: String,
    mixins: Vec<String>,
    children: Vec<String>,
    properties: BTreeMap<String, PropertyValue>,
}

impl NodeRecord {
    fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            mixins: Vec::new(),
            children: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct TreeState {
    nodes: BTreeMap<NodePath, NodeRecord>,
    tx_snapshot: Option<BTreeMap<NodePath, NodeRecord>>,
    fail_on_save: bool,
}

/// In-memory, `BTreeMap`-backed node session.
///
/// Intended for tests and embedding. The whole tree is held behind a
/// `RwLock`; node snapshots are cloned out. Transactions are supported via
/// a full-state snapshot taken at `begin_transaction` and restored on
/// rollback.
pub struct InMemoryNodeSession {
    state: RwLock<TreeState>,
}

impl InMemoryNodeSession {
    /// Create a session over a fresh tree containing only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodePath::root(), NodeRecord::new("canopy:root"));
        Self {
            state: RwLock::new(TreeState {
                nodes,
                tx_snapshot: None,
                fail_on_save: false,
            }),
        }
    }

    /// Make the next `save` calls fail with a backend error. Used to test
    /// commit-failure handling in callers.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.state.write().expect("lock poisoned").fail_on_save = fail;
    }

    /// Number of nodes in the tree, including the root.
    pub fn len(&self) -> usize {
        self.state.read().expect("lock poisoned").nodes.len()
    }

    /// Returns `true` if only the root node exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// All node paths in the tree, sorted.
    pub fn all_paths(&self) -> Vec<NodePath> {
        let state = self.state.read().expect("lock poisoned");
        state.nodes.keys().cloned().collect()
    }

    fn snapshot_of(path: &NodePath, record: &NodeRecord) -> Node {
        Node {
            path: path.clone(),
            node_type: record.node_type.clone(),
            mixins: record.mixins.clone(),
            children: record.children.clone(),
            properties: record.properties.clone(),
        }
    }
}

impl Default for InMemoryNodeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSession for InMemoryNodeSession {
    fn node(&self, path: &NodePath) -> StoreResult<Option<Node>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .nodes
            .get(path)
            .map(|record| Self::snapshot_of(path, record)))
    }

    fn create_node(&self, parent: &NodePath, name: &str, node_type: &str) -> StoreResult<Node> {
        let path = parent.join(name)?;
        let mut state = self.state.write().expect("lock poisoned");
        if !state.nodes.contains_key(parent) {
            return Err(StoreError::NotFound(parent.clone()));
        }
        if state.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        state.nodes.insert(path.clone(), NodeRecord::new(node_type));
        let parent_record = state
            .nodes
            .get_mut(parent)
            .expect("parent checked above");
        parent_record.children.push(name.to_string());
        debug!(path = %path, node_type, "node created");
        Ok(Node::new(path, node_type))
    }

    fn remove_node(&self, path: &NodePath) -> StoreResult<bool> {
        if path.is_root() {
            return Err(StoreError::RootImmutable("removed"));
        }
        let mut state = self.state.write().expect("lock poisoned");
        if !state.nodes.contains_key(path) {
            return Ok(false);
        }
        let doomed: Vec<NodePath> = state
            .nodes
            .keys()
            .filter(|p| *p == path || path.is_ancestor_of(p))
            .cloned()
            .collect();
        for p in &doomed {
            state.nodes.remove(p);
        }
        if let Some(parent) = path.parent() {
            if let Some(parent_record) = state.nodes.get_mut(&parent) {
                parent_record.children.retain(|c| c != path.name());
            }
        }
        debug!(path = %path, subtree = doomed.len(), "node removed");
        Ok(true)
    }

    fn move_node(&self, src: &NodePath, dst: &NodePath) -> StoreResult<()> {
        if src.is_root() {
            return Err(StoreError::RootImmutable("moved"));
        }
        if src == dst {
            return Ok(());
        }
        let dst_parent = dst
            .parent()
            .ok_or(StoreError::RootImmutable("replaced by a move"))?;
        let mut state = self.state.write().expect("lock poisoned");
        if !state.nodes.contains_key(src) {
            return Err(StoreError::NotFound(src.clone()));
        }
        if !state.nodes.contains_key(&dst_parent) {
            return Err(StoreError::NotFound(dst_parent));
        }
        if state.nodes.contains_key(dst) {
            return Err(StoreError::NodeExists(dst.clone()));
        }

        let moved: Vec<NodePath> = state
            .nodes
            .keys()
            .filter(|p| *p == src || src.is_ancestor_of(p))
            .cloned()
            .collect();
        for old in &moved {
            let record = state.nodes.remove(old).expect("key came from the map");
            let new = old
                .reparent(src, dst)
                .expect("moved paths lie under src");
            state.nodes.insert(new, record);
        }

        if let Some(src_parent) = src.parent() {
            if let Some(record) = state.nodes.get_mut(&src_parent) {
                record.children.retain(|c| c != src.name());
            }
        }
        let dst_record = state
            .nodes
            .get_mut(&dst_parent)
            .expect("destination parent checked above");
        dst_record.children.push(dst.name().to_string());
        debug!(src = %src, dst = %dst, subtree = moved.len(), "node moved");
        Ok(())
    }

    fn set_property(&self, path: &NodePath, name: &str, value: PropertyValue) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let record = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        record.properties.insert(name.to_string(), value);
        Ok(())
    }

    fn remove_property(&self, path: &NodePath, name: &str) -> StoreResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        let record = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        Ok(record.properties.remove(name).is_some())
    }

    fn property(&self, path: &NodePath, name: &str) -> StoreResult<Option<PropertyValue>> {
        let state = self.state.read().expect("lock poisoned");
        let record = state
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        Ok(record.properties.get(name).cloned())
    }

    fn child_names(&self, path: &NodePath, filter: Option<&str>) -> StoreResult<Vec<String>> {
        let state = self.state.read().expect("lock poisoned");
        let record = state
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        let names = record
            .children
            .iter()
            .filter(|name| filter.map_or(true, |f| name.starts_with(f)))
            .cloned()
            .collect();
        Ok(names)
    }

    fn order_before(&self, parent: &NodePath, name: &str, before: Option<&str>) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let record = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NotFound(parent.clone()))?;
        let from = record
            .children
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| StoreError::NoSuchChild {
                parent: parent.clone(),
                name: name.to_string(),
            })?;
        let moved = record.children.remove(from);
        match before {
            Some(target) => {
                let to = record
                    .children
                    .iter()
                    .position(|c| c == target)
                    .ok_or_else(|| StoreError::NoSuchChild {
                        parent: parent.clone(),
                        name: target.to_string(),
                    })?;
                record.children.insert(to, moved);
            }
            None => record.children.push(moved),
        }
        Ok(())
    }

    fn add_mixin(&self, path: &NodePath, mixin: &str) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let record = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        if !record.mixins.iter().any(|m| m == mixin) {
            record.mixins.push(mixin.to_string());
        }
        Ok(())
    }

    fn has_mixin(&self, path: &NodePath, mixin: &str) -> StoreResult<bool> {
        let state = self.state.read().expect("lock poisoned");
        let record = state
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        Ok(record.mixins.iter().any(|m| m == mixin))
    }

    fn referrers(&self, target: &NodePath, property: Option<&str>) -> StoreResult<Vec<NodePath>> {
        let state = self.state.read().expect("lock poisoned");
        let mut found = Vec::new();
        for (path, record) in &state.nodes {
            let references = record.properties.iter().any(|(name, value)| {
                property.map_or(true, |p| name == p)
                    && value.referenced_paths().contains(&target)
            });
            if references {
                found.push(path.clone());
            }
        }
        Ok(found)
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn begin_transaction(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.tx_snapshot.is_some() {
            return Err(StoreError::Backend(
                "transaction already in progress".into(),
            ));
        }
        state.tx_snapshot = Some(state.nodes.clone());
        Ok(())
    }

    fn commit_transaction(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.tx_snapshot.take().is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(())
    }

    fn rollback_transaction(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let snapshot = state.tx_snapshot.take().ok_or(StoreError::NoTransaction)?;
        state.nodes = snapshot;
        debug!("transaction rolled back");
        Ok(())
    }

    fn save(&self) -> StoreResult<()> {
        let state = self.state.read().expect("lock poisoned");
        if state.fail_on_save {
            return Err(StoreError::Backend("save failed".into()));
        }
        Ok(())
    }

    fn refresh(&self, _keep_changes: bool) -> StoreResult<()> {
        // Memory is its own backend; there is nothing newer to read.
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryNodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNodeSession")
            .field("node_count", &self.len())
            .finish()
    }
}
