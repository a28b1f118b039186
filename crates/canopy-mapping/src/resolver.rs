use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a mapped document class.
///
/// Every node written by Canopy is stamped with its class tag so a later
/// load can reconstruct the document type. Tags are plain strings rather
/// than a language-level type system: resolution is a closed lookup against
/// the registered mappings, never reflection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a tag from a class name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The fallback tag for nodes whose stored class is unknown.
    pub fn generic() -> Self {
        Self("canopy.Generic".into())
    }

    /// Returns `true` if this is the generic fallback tag.
    pub fn is_generic(&self) -> bool {
        self.0 == "canopy.Generic"
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Closed-variant resolver from stored class names to registered tags.
///
/// The resolver knows the set of tags that have mappings. A stored class
/// name that matches a known tag resolves to it; anything else falls back
/// to [`TypeTag::generic`], which always has a mapping. This replaces
/// runtime class reflection: the set of resolvable types is fixed at
/// registry construction.
#[derive(Clone, Debug)]
pub struct TypeResolver {
    known: BTreeSet<TypeTag>,
}

impl TypeResolver {
    /// Build a resolver over the given set of known tags.
    pub fn new(known: impl IntoIterator<Item = TypeTag>) -> Self {
        Self {
            known: known.into_iter().collect(),
        }
    }

    /// Resolve a stored class name to a known tag, or the generic fallback.
    pub fn resolve(&self, stored: &str) -> TypeTag {
        let candidate = TypeTag::new(stored);
        if self.known.contains(&candidate) {
            candidate
        } else {
            TypeTag::generic()
        }
    }

    /// Returns `true` if the tag resolves without falling back.
    pub fn knows(&self, tag: &TypeTag) -> bool {
        self.known.contains(tag)
    }
}
