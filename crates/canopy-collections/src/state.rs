use serde::{Deserialize, Serialize};

/// Initialization state of a lazy collection.
///
/// `Initializing` is observable only while the manager is loading the
/// collection's content; it exists so re-entrant loads (a load cascading
/// back into the same collection) can be detected instead of recursing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionState {
    /// No content loaded; only self-load metadata is present.
    Uninitialized,
    /// The manager is currently materializing the content.
    Initializing,
    /// Content was materialized from the backing store.
    FromStore,
    /// Content was supplied by application code before any load.
    FromCollection,
}

impl CollectionState {
    /// Returns `true` once content is present.
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::FromStore | Self::FromCollection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialized_states() {
        assert!(!CollectionState::Uninitialized.is_initialized());
        assert!(!CollectionState::Initializing.is_initialized());
        assert!(CollectionState::FromStore.is_initialized());
        assert!(CollectionState::FromCollection.is_initialized());
    }
}
