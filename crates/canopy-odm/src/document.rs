use std::collections::BTreeMap;

use canopy_collections::{ChildrenCollection, ReferenceManyCollection, ReferrersCollection};
use canopy_mapping::TypeTag;
use canopy_types::{DocumentHandle, NodePath, PropertyValue};

/// A single-document reference value.
///
/// `Lazy` is the uninitialized stand-in created at load time from the
/// stored path; the manager swaps it for `Loaded` on first dereference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Target known only by path; not yet materialized.
    Lazy(NodePath),
    /// Target materialized and tracked.
    Loaded(DocumentHandle),
}

impl Reference {
    /// Returns `true` once the target has been materialized.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// The loaded handle, if materialized.
    pub fn handle(&self) -> Option<DocumentHandle> {
        match self {
            Self::Loaded(h) => Some(*h),
            Self::Lazy(_) => None,
        }
    }
}

/// An in-memory document bound (or to be bound) to a repository node.
///
/// Canopy documents are dynamic records: scalar/multivalue fields live in
/// a name-keyed map and associations live in kind-specific slots. Which
/// fields and associations are persisted, and how, is decided entirely by
/// the class mapping for [`Document::tag`]; unmapped entries are carried
/// in memory but never written (unless the mapping is dynamic).
#[derive(Clone, Debug)]
pub struct Document {
    /// Class tag resolving to this document's mapping.
    pub tag: TypeTag,
    /// Repository path; `None` until assigned by persist or load.
    pub id: Option<NodePath>,
    /// Backing node name; overridden by the mapping's nodename field.
    pub node_name: Option<String>,
    /// Parent document, when tracked in memory.
    pub parent: Option<DocumentHandle>,
    /// Scalar and multivalue field values, keyed by field name.
    pub fields: BTreeMap<String, PropertyValue>,
    /// Named single-child associations.
    pub singles: BTreeMap<String, DocumentHandle>,
    /// Ordered children collections, keyed by association name.
    pub children: BTreeMap<String, ChildrenCollection>,
    /// Single references, keyed by association name.
    pub references: BTreeMap<String, Reference>,
    /// Multi-reference collections, keyed by association name.
    pub many_references: BTreeMap<String, ReferenceManyCollection>,
    /// Referrer collections, keyed by association name.
    pub referrers: BTreeMap<String, ReferrersCollection>,
    /// Currently bound translation locale.
    pub locale: Option<String>,
}

impl Document {
    /// A new, empty document of the given class.
    pub fn new(tag: TypeTag) -> Self {
        Self {
            tag,
            id: None,
            node_name: None,
            parent: None,
            fields: BTreeMap::new(),
            singles: BTreeMap::new(),
            children: BTreeMap::new(),
            references: BTreeMap::new(),
            many_references: BTreeMap::new(),
            referrers: BTreeMap::new(),
            locale: None,
        }
    }

    /// Set the assigned identifier (for the assigned-id strategy).
    pub fn with_id(mut self, id: NodePath) -> Self {
        self.node_name = Some(id.name().to_string());
        self.id = Some(id);
        self
    }

    /// Set the node name used by name-deriving identifier strategies.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Set a field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Read a field value.
    pub fn field(&self, name: &str) -> Option<&PropertyValue> {
        self.fields.get(name)
    }

    /// Write a field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Remove a field value. Returns the previous value, if any.
    pub fn unset_field(&mut self, name: &str) -> Option<PropertyValue> {
        self.fields.remove(name)
    }

    /// The effective node name: the nodename field is consulted by the
    /// unit of work, this accessor reports the plain slot.
    pub fn name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }
}
