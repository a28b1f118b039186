use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::NodePath;

/// A typed value stored on a node property.
///
/// The storage model is deliberately small: strings, 64-bit integers,
/// doubles, booleans, node references (paths), and homogeneous or mixed
/// multivalue lists of the above. Multivalue nesting deeper than one level
/// is not representable, matching the backing store's property model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    /// A reference to another node, stored as its absolute path.
    Path(NodePath),
    /// An ordered multivalue property.
    Multi(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Human-readable name of the value's storage type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::Path(_) => "path",
            Self::Multi(_) => "multi",
        }
    }

    /// Returns `true` for multivalue properties.
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }

    /// String content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is a long value.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Referenced path, if this is a path value.
    pub fn as_path(&self) -> Option<&NodePath> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Multivalue content, if this is a multivalue property.
    pub fn as_multi(&self) -> Option<&[PropertyValue]> {
        match self {
            Self::Multi(values) => Some(values),
            _ => None,
        }
    }

    /// Collect every path referenced by this value: the path itself for a
    /// path value, each path element for a multivalue.
    pub fn referenced_paths(&self) -> Vec<&NodePath> {
        match self {
            Self::Path(p) => vec![p],
            Self::Multi(values) => values.iter().filter_map(|v| v.as_path()).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Path(p) => write!(f, "{p}"),
            Self::Multi(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<NodePath> for PropertyValue {
    fn from(p: NodePath) -> Self {
        Self::Path(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> NodePath {
        NodePath::new(s).unwrap()
    }

    #[test]
    fn type_names() {
        assert_eq!(PropertyValue::from("x").type_name(), "string");
        assert_eq!(PropertyValue::from(1i64).type_name(), "long");
        assert_eq!(PropertyValue::Double(1.5).type_name(), "double");
        assert_eq!(PropertyValue::from(true).type_name(), "boolean");
        assert_eq!(PropertyValue::from(p("/a")).type_name(), "path");
        assert_eq!(PropertyValue::Multi(vec![]).type_name(), "multi");
    }

    #[test]
    fn accessors() {
        assert_eq!(PropertyValue::from("hi").as_str(), Some("hi"));
        assert_eq!(PropertyValue::from(7i64).as_long(), Some(7));
        assert_eq!(PropertyValue::from(true).as_bool(), Some(true));
        assert_eq!(PropertyValue::from(p("/a")).as_path(), Some(&p("/a")));
        assert!(PropertyValue::from("hi").as_long().is_none());
    }

    #[test]
    fn referenced_paths_for_scalar() {
        assert!(PropertyValue::from("x").referenced_paths().is_empty());
        assert_eq!(PropertyValue::from(p("/a")).referenced_paths(), vec![&p("/a")]);
    }

    #[test]
    fn referenced_paths_for_multi() {
        let value = PropertyValue::Multi(vec![
            PropertyValue::from(p("/a")),
            PropertyValue::from("not a path"),
            PropertyValue::from(p("/b")),
        ]);
        assert_eq!(value.referenced_paths(), vec![&p("/a"), &p("/b")]);
    }

    #[test]
    fn serde_roundtrip() {
        let value = PropertyValue::Multi(vec![
            PropertyValue::from("a"),
            PropertyValue::from(42i64),
            PropertyValue::from(p("/ref")),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let parsed: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, parsed);
    }
}
