use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked document.
///
/// Transitions: `New` documents become `Managed` through persist (directly
/// or via cascade), `Managed` documents become `Removed` through remove and
/// are purged after a successful commit, and `Detached` documents are no
/// longer synchronized but keep their last-known identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    /// Created by application code, not yet known to the store.
    New,
    /// Tracked by the identity map and synchronized on commit.
    Managed,
    /// Scheduled for removal; purged from tracking after commit.
    Removed,
    /// No longer tracked; passing it to a cascading operation is an error.
    Detached,
}

impl DocumentState {
    /// Returns `true` if the document participates in change tracking.
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed)
    }

    /// Returns `true` if the document is scheduled for removal.
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Returns `true` if the document has been detached from tracking.
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Detached)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Managed => "managed",
            Self::Removed => "removed",
            Self::Detached => "detached",
        };
        write!(f, "{s}")
    }
}
