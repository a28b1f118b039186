use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use canopy_types::{NodePath, PropertyValue};

/// A point-in-time snapshot of one stored node.
///
/// Sessions hand out `Node` values by clone; mutating a snapshot does not
/// write through. All writes go back through the session API so the
/// session can track them for `save`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Absolute path of the node.
    pub path: NodePath,
    /// Primary node type.
    pub node_type: String,
    /// Mixin types attached to the node.
    pub mixins: Vec<String>,
    /// Child node names in storage order.
    pub children: Vec<String>,
    /// Typed properties.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Node {
    /// Create an empty node snapshot.
    pub fn new(path: NodePath, node_type: impl Into<String>) -> Self {
        Self {
            path,
            node_type: node_type.into(),
            mixins: Vec::new(),
            children: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// The node name (final path segment).
    pub fn name(&self) -> &str {
        self.path.name()
    }

    /// Read a property.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Returns `true` if the node carries the given mixin type.
    pub fn has_mixin(&self, mixin: &str) -> bool {
        self.mixins.iter().any(|m| m == mixin)
    }

    /// Number of child nodes.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}
