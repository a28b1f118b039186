use serde::{Deserialize, Serialize};

/// The kind of an association between a document and other documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    /// The single parent document in the hierarchy.
    Parent,
    /// A named single child document; its node name is the association name.
    Child,
    /// An ordered, keyed collection of child documents.
    Children,
    /// A single reference to another document, stored as a path property.
    ReferenceOne,
    /// An ordered multi-reference, stored as a multivalue path property.
    ReferenceMany,
    /// The computed set of documents referencing this one (read-mostly).
    Referrers,
}

impl AssociationKind {
    /// Returns `true` for the hierarchy kinds (parent/child/children).
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Self::Parent | Self::Child | Self::Children)
    }

    /// Returns `true` for kinds persisted through a node property.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::ReferenceOne | Self::ReferenceMany)
    }
}

/// Cascade flags controlling how operations propagate across an
/// association during graph traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cascade {
    /// Persist reachable new documents when the owner is persisted.
    pub persist: bool,
    /// Remove reachable documents when the owner is removed.
    pub remove: bool,
    /// Refresh reachable documents when the owner is refreshed.
    pub refresh: bool,
    /// Detach reachable documents when the owner is detached.
    pub detach: bool,
    /// Merge reachable documents when the owner is merged.
    pub merge: bool,
}

impl Cascade {
    /// No cascading at all.
    pub fn none() -> Self {
        Self {
            persist: false,
            remove: false,
            refresh: false,
            detach: false,
            merge: false,
        }
    }

    /// Every operation cascades.
    pub fn all() -> Self {
        Self {
            persist: true,
            remove: true,
            refresh: true,
            detach: true,
            merge: true,
        }
    }

    /// Persist-only cascade, the common setting for owned children.
    pub fn persist() -> Self {
        Self {
            persist: true,
            ..Self::none()
        }
    }

    /// Persist and remove, the full ownership cascade.
    pub fn owned() -> Self {
        Self {
            persist: true,
            remove: true,
            ..Self::none()
        }
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Self::none()
    }
}

/// One mapped association of a document class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMapping {
    /// Association name on the document.
    pub name: String,
    /// What shape of association this is.
    pub kind: AssociationKind,
    /// Cascade flags for graph traversal.
    pub cascade: Cascade,
    /// Storage property holding the reference path(s); `None` for the
    /// hierarchy kinds, which are expressed by node placement instead.
    pub property: Option<String>,
    /// Name filter applied when enumerating children or referrers.
    pub filter: Option<String>,
}

impl AssociationMapping {
    /// A parent association.
    pub fn parent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::Parent,
            cascade: Cascade::none(),
            property: None,
            filter: None,
        }
    }

    /// A named single-child association.
    pub fn child(name: impl Into<String>, cascade: Cascade) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::Child,
            cascade,
            property: None,
            filter: None,
        }
    }

    /// An ordered children collection.
    pub fn children(name: impl Into<String>, cascade: Cascade) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::Children,
            cascade,
            property: None,
            filter: None,
        }
    }

    /// A single reference stored on `property`.
    pub fn reference_one(
        name: impl Into<String>,
        property: impl Into<String>,
        cascade: Cascade,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::ReferenceOne,
            cascade,
            property: Some(property.into()),
            filter: None,
        }
    }

    /// A multi-reference stored on `property`.
    pub fn reference_many(
        name: impl Into<String>,
        property: impl Into<String>,
        cascade: Cascade,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::ReferenceMany,
            cascade,
            property: Some(property.into()),
            filter: None,
        }
    }

    /// A computed referrers collection, optionally filtered by the
    /// referencing property name.
    pub fn referrers(name: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::Referrers,
            cascade: Cascade::none(),
            property: None,
            filter,
        }
    }

    /// Restrict child/referrer enumeration to names matching `filter`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}
