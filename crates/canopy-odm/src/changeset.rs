use std::collections::BTreeMap;

use canopy_types::PropertyValue;

/// One child repositioning: place `key` immediately before `before`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorderPair {
    pub key: String,
    pub before: String,
}

impl ReorderPair {
    pub fn new(key: impl Into<String>, before: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            before: before.into(),
        }
    }
}

/// The computed delta for one document, consumed at flush.
///
/// `fields` maps storage properties to their new values; `None` means the
/// property is removed. `reorderings` is the insert-before sequence that
/// transforms the original child order into the live order.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub fields: BTreeMap<String, Option<PropertyValue>>,
    pub reorderings: Vec<ReorderPair>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.reorderings.is_empty()
    }
}
