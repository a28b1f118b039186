use canopy_types::{NodePath, PropertyValue};

use crate::error::StoreResult;
use crate::node::Node;

/// Session onto a hierarchical node store.
///
/// This is the entire surface the unit of work consumes; everything below
/// it (wire protocol, persistence format, caching) is a backend concern.
/// Implementations must satisfy these invariants:
///
/// - Lookup misses are `Ok(None)`, never errors.
/// - Mutations are visible to subsequent reads in the same session before
///   `save` is called; `save` is the durability boundary.
/// - `move_node` carries the whole subtree and preserves child order.
/// - Transactions are optional: `supports_transactions` returning `false`
///   makes `begin`/`commit_transaction`/`rollback_transaction` no-ops.
pub trait NodeSession: Send + Sync {
    /// Fetch a node snapshot by path. `Ok(None)` if absent.
    fn node(&self, path: &NodePath) -> StoreResult<Option<Node>>;

    /// Batch fetch. Default implementation calls `node()` per path;
    /// backends may override to reduce round-trips.
    fn nodes(&self, paths: &[NodePath]) -> StoreResult<Vec<Option<Node>>> {
        paths.iter().map(|p| self.node(p)).collect()
    }

    /// Returns `true` if a node exists at `path`.
    fn exists(&self, path: &NodePath) -> StoreResult<bool> {
        Ok(self.node(path)?.is_some())
    }

    /// Create a child node under an existing parent and return its
    /// snapshot. Fails if the parent is missing or the name is taken.
    fn create_node(
        &self,
        parent: &NodePath,
        name: &str,
        node_type: &str,
    ) -> StoreResult<Node>;

    /// Remove the node and its whole subtree. Returns `true` if it existed.
    fn remove_node(&self, path: &NodePath) -> StoreResult<bool>;

    /// Move the subtree at `src` to `dst`. The `dst` parent must exist and
    /// the `dst` name must be free.
    fn move_node(&self, src: &NodePath, dst: &NodePath) -> StoreResult<()>;

    /// Write a property.
    fn set_property(
        &self,
        path: &NodePath,
        name: &str,
        value: PropertyValue,
    ) -> StoreResult<()>;

    /// Remove a property. Returns `true` if it existed.
    fn remove_property(&self, path: &NodePath, name: &str) -> StoreResult<bool>;

    /// Read a single property. `Ok(None)` if the node exists but the
    /// property does not.
    fn property(&self, path: &NodePath, name: &str) -> StoreResult<Option<PropertyValue>>;

    /// Child node names in storage order, optionally restricted to names
    /// starting with `filter`.
    fn child_names(&self, path: &NodePath, filter: Option<&str>) -> StoreResult<Vec<String>>;

    /// Reposition child `name` before sibling `before` (or to the end when
    /// `before` is `None`).
    fn order_before(
        &self,
        parent: &NodePath,
        name: &str,
        before: Option<&str>,
    ) -> StoreResult<()>;

    /// Attach a mixin type to a node. Idempotent.
    fn add_mixin(&self, path: &NodePath, mixin: &str) -> StoreResult<()>;

    /// Returns `true` if the node carries the mixin.
    fn has_mixin(&self, path: &NodePath, mixin: &str) -> StoreResult<bool>;

    /// Paths of nodes holding a path-valued property that references
    /// `target`, optionally restricted to a property name.
    fn referrers(
        &self,
        target: &NodePath,
        property: Option<&str>,
    ) -> StoreResult<Vec<NodePath>>;

    /// Whether this backend supports transactions.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Begin a transaction. No-op when unsupported.
    fn begin_transaction(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Commit the open transaction. No-op when unsupported.
    fn commit_transaction(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Roll back the open transaction. No-op when unsupported.
    fn rollback_transaction(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Persist all pending session changes.
    fn save(&self) -> StoreResult<()>;

    /// Discard (or keep, per `keep_changes`) pending changes and re-read
    /// from the backend.
    fn refresh(&self, keep_changes: bool) -> StoreResult<()>;
}
