use serde::{Deserialize, Serialize};

use crate::assoc::{AssociationKind, AssociationMapping};
use crate::resolver::TypeTag;

/// How a document obtains its identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdStrategy {
    /// The application assigns the full path before persist.
    Assigned,
    /// The id is computed as `{parent id}/{node name}`.
    ParentAndName,
    /// Like `ParentAndName`, but a name is generated when none is set.
    AutoName,
}

/// Versioning mode of a document class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Versioning {
    /// Not versioned.
    None,
    /// Linear version history.
    Simple,
    /// Full version history with branches.
    Full,
}

/// One mapped scalar or multivalue field of a document class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name on the document.
    pub name: String,
    /// Storage property the field maps to.
    pub property: String,
    /// Whether the storage property is multivalue.
    pub multivalue: bool,
    /// Whether the field is written per-locale by a translation strategy.
    pub translated: bool,
    /// Version-metadata fields are derived by the store and excluded from
    /// change-set computation.
    pub version_metadata: bool,
}

impl FieldMapping {
    /// A plain field mapped to `property`.
    pub fn new(name: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            property: property.into(),
            multivalue: false,
            translated: false,
            version_metadata: false,
        }
    }

    /// Mark the field as multivalue.
    pub fn multivalue(mut self) -> Self {
        self.multivalue = true;
        self
    }

    /// Mark the field as translated (persisted per-locale).
    pub fn translated(mut self) -> Self {
        self.translated = true;
        self
    }

    /// Mark the field as store-derived version metadata.
    pub fn version_metadata(mut self) -> Self {
        self.version_metadata = true;
        self
    }
}

/// Per-document-type mapping descriptor.
///
/// Produced by an external mapping driver and consumed read-only by the
/// unit of work. A mapping with `dynamic` set maps every document field to
/// a same-named property; this backs the generic fallback class for nodes
/// whose stored type is unknown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMapping {
    /// The class tag this mapping describes.
    pub tag: TypeTag,
    /// Primary node type stamped on created nodes.
    pub node_type: String,
    /// Mapped fields.
    pub fields: Vec<FieldMapping>,
    /// Mapped associations.
    pub associations: Vec<AssociationMapping>,
    /// Identifier strategy.
    pub id_strategy: IdStrategy,
    /// Versioning mode.
    pub versioning: Versioning,
    /// Key of the translation strategy for translated fields.
    pub translator: Option<String>,
    /// Field whose value overrides the node name.
    pub nodename_field: Option<String>,
    /// Map unmapped document fields 1:1 to same-named properties.
    pub dynamic: bool,
}

impl ClassMapping {
    /// A new mapping with no fields or associations.
    pub fn of(tag: TypeTag, node_type: impl Into<String>) -> Self {
        Self {
            tag,
            node_type: node_type.into(),
            fields: Vec::new(),
            associations: Vec::new(),
            id_strategy: IdStrategy::Assigned,
            versioning: Versioning::None,
            translator: None,
            nodename_field: None,
            dynamic: false,
        }
    }

    /// The mapping used for nodes whose stored class cannot be resolved.
    pub fn generic() -> Self {
        let mut mapping = Self::of(TypeTag::generic(), "canopy:generic");
        mapping.dynamic = true;
        mapping
    }

    /// Add a field mapping.
    pub fn with_field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an association mapping.
    pub fn with_association(mut self, assoc: AssociationMapping) -> Self {
        self.associations.push(assoc);
        self
    }

    /// Set the identifier strategy.
    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Set the versioning mode.
    pub fn with_versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    /// Set the translation strategy key.
    pub fn with_translator(mut self, key: impl Into<String>) -> Self {
        self.translator = Some(key.into());
        self
    }

    /// Set the field whose value names the backing node.
    pub fn with_nodename_field(mut self, field: impl Into<String>) -> Self {
        self.nodename_field = Some(field.into());
        self
    }

    /// Look up a field mapping by field name.
    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up an association mapping by name.
    pub fn association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// All associations of the given kind, in declaration order.
    pub fn associations_of(&self, kind: AssociationKind) -> impl Iterator<Item = &AssociationMapping> {
        self.associations.iter().filter(move |a| a.kind == kind)
    }

    /// Returns `true` if any field is translated.
    pub fn has_translated_fields(&self) -> bool {
        self.fields.iter().any(|f| f.translated)
    }

    /// Returns `true` if the class is versioned.
    pub fn is_versioned(&self) -> bool {
        !matches!(self.versioning, Versioning::None)
    }
}
