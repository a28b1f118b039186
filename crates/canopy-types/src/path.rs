use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Absolute path of a node in the content repository.
///
/// A `NodePath` is the stable identifier of a document. It is always
/// absolute (`/content/articles/intro`), contains no empty segments, and
/// carries no trailing slash except for the root path `/`. Paths are
/// validated on construction and immutable afterwards; the only way a
/// document's path changes is through an explicit move, which rewrites the
/// identifier wholesale.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath {
    inner: String,
}

impl NodePath {
    /// Parse and validate an absolute path.
    pub fn new(path: impl Into<String>) -> Result<Self, TypeError> {
        let path = path.into();
        if path == "/" {
            return Ok(Self { inner: path });
        }
        if !path.starts_with('/') {
            return Err(TypeError::InvalidPath(format!("not absolute: {path}")));
        }
        if path.ends_with('/') {
            return Err(TypeError::InvalidPath(format!("trailing slash: {path}")));
        }
        for segment in path[1..].split('/') {
            if !Self::is_valid_name(segment) {
                return Err(TypeError::InvalidPath(format!(
                    "invalid segment {segment:?} in {path}"
                )));
            }
        }
        Ok(Self { inner: path })
    }

    /// The repository root path `/`.
    pub fn root() -> Self {
        Self { inner: "/".into() }
    }

    /// Returns `true` if `name` is usable as a single path segment.
    ///
    /// Segments must be non-empty, must not contain `/`, and must not be
    /// the reserved names `.` or `..`.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name != "." && name != ".." && !name.contains('/')
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Returns `true` if this is the root path.
    pub fn is_root(&self) -> bool {
        self.inner == "/"
    }

    /// The final path segment (the node name). Empty for the root.
    pub fn name(&self) -> &str {
        match self.inner.rfind('/') {
            Some(idx) => &self.inner[idx + 1..],
            None => "",
        }
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        match self.inner.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self {
                inner: self.inner[..idx].to_string(),
            }),
            None => None,
        }
    }

    /// Number of segments below the root. The root itself has depth 0.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.inner.matches('/').count()
        }
    }

    /// Append a child segment to this path.
    pub fn join(&self, name: &str) -> Result<NodePath, TypeError> {
        if !Self::is_valid_name(name) {
            return Err(TypeError::InvalidName(name.to_string()));
        }
        let joined = if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.inner)
        };
        Ok(Self { inner: joined })
    }

    /// Returns `true` if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.inner.len() > self.inner.len()
            && other.inner.starts_with(&self.inner)
            && other.inner.as_bytes()[self.inner.len()] == b'/'
    }

    /// Rewrite this path by replacing the `old_prefix` ancestor with
    /// `new_prefix`. Returns `None` if `old_prefix` is not an ancestor of
    /// (or equal to) this path.
    ///
    /// Used when a subtree moves: every cached descendant identifier is
    /// translated to its post-move location.
    pub fn reparent(&self, old_prefix: &NodePath, new_prefix: &NodePath) -> Option<NodePath> {
        if self == old_prefix {
            return Some(new_prefix.clone());
        }
        if !old_prefix.is_ancestor_of(self) {
            return None;
        }
        let suffix = &self.inner[old_prefix.inner.len()..];
        let inner = if new_prefix.is_root() {
            suffix.to_string()
        } else {
            format!("{}{suffix}", new_prefix.inner)
        };
        Some(Self { inner })
    }
}

impl TryFrom<String> for NodePath {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodePath {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodePath> for String {
    fn from(path: NodePath) -> Self {
        path.inner
    }
}

impl fmt::Debug for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePath({})", self.inner)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> NodePath {
        NodePath::new(s).unwrap()
    }

    #[test]
    fn root_is_valid() {
        let root = NodePath::root();
        assert!(root.is_root());
        assert_eq!(root.as_str(), "/");
        assert_eq!(root.depth(), 0);
        assert_eq!(root.name(), "");
        assert!(root.parent().is_none());
    }

    #[test]
    fn relative_path_is_rejected() {
        assert!(NodePath::new("content/a").is_err());
    }

    #[test]
    fn trailing_slash_is_rejected() {
        assert!(NodePath::new("/content/").is_err());
    }

    #[test]
    fn empty_segment_is_rejected() {
        assert!(NodePath::new("/content//a").is_err());
    }

    #[test]
    fn dot_segments_are_rejected() {
        assert!(NodePath::new("/a/./b").is_err());
        assert!(NodePath::new("/a/../b").is_err());
    }

    #[test]
    fn name_and_parent() {
        let path = p("/content/articles/intro");
        assert_eq!(path.name(), "intro");
        assert_eq!(path.parent().unwrap(), p("/content/articles"));
        assert_eq!(p("/content").parent().unwrap(), NodePath::root());
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(p("/a").depth(), 1);
        assert_eq!(p("/a/b/c").depth(), 3);
    }

    #[test]
    fn join_builds_child_paths() {
        assert_eq!(NodePath::root().join("a").unwrap(), p("/a"));
        assert_eq!(p("/a/b").join("c").unwrap(), p("/a/b/c"));
        assert!(p("/a").join("").is_err());
        assert!(p("/a").join("x/y").is_err());
    }

    #[test]
    fn ancestor_checks() {
        assert!(p("/a").is_ancestor_of(&p("/a/b")));
        assert!(p("/a").is_ancestor_of(&p("/a/b/c")));
        assert!(NodePath::root().is_ancestor_of(&p("/a")));
        assert!(!p("/a").is_ancestor_of(&p("/a")));
        assert!(!p("/a").is_ancestor_of(&p("/ab")));
        assert!(!p("/a/b").is_ancestor_of(&p("/a")));
    }

    #[test]
    fn reparent_rewrites_prefix() {
        let moved = p("/a/b/c").reparent(&p("/a/b"), &p("/x/y")).unwrap();
        assert_eq!(moved, p("/x/y/c"));
        assert_eq!(p("/a/b").reparent(&p("/a/b"), &p("/x")).unwrap(), p("/x"));
        assert!(p("/other").reparent(&p("/a"), &p("/x")).is_none());
    }

    #[test]
    fn reparent_does_not_match_sibling_prefix() {
        // /ab is not under /a even though the string starts with it.
        assert!(p("/ab").reparent(&p("/a"), &p("/x")).is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let path = p("/content/articles");
        let json = serde_json::to_string(&path).unwrap();
        let parsed: NodePath = serde_json::from_str(&json).unwrap();
        assert_eq!(path, parsed);
    }

    #[test]
    fn serde_rejects_invalid() {
        assert!(serde_json::from_str::<NodePath>("\"no-slash\"").is_err());
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(p("/a") < p("/a/b"));
        assert!(p("/a/b") < p("/b"));
    }
}
