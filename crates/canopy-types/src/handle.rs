use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle to a tracked in-memory document.
///
/// Handles are allocated by the document registry when a document first
/// enters tracking and stay stable for the life of the instance. Every
/// side-table in the unit of work (snapshots, operation queues, locale
/// state) is indexed by handle, so handle equality is instance identity:
/// two lookups that yield the same handle yield the same document.
///
/// A handle says nothing about lifecycle state; a handle whose document has
/// been cleared from the registry simply no longer resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    /// Create a handle from its raw index. Reserved for registry use;
    /// handles minted elsewhere will not resolve.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw index backing this handle.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentHandle(#{})", self.0)
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc:#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        let handle = DocumentHandle::from_raw(7);
        assert_eq!(handle.as_raw(), 7);
    }

    #[test]
    fn equality_is_raw_equality() {
        assert_eq!(DocumentHandle::from_raw(1), DocumentHandle::from_raw(1));
        assert_ne!(DocumentHandle::from_raw(1), DocumentHandle::from_raw(2));
    }

    #[test]
    fn display_format() {
        assert_eq!(DocumentHandle::from_raw(42).to_string(), "doc:#42");
    }
}
