use std::collections::BTreeMap;

use canopy_mapping::ClassMapping;
use canopy_store::NodeSession;
use canopy_types::{NodePath, PropertyValue};

use crate::error::OdmResult;

/// Strategy for persisting translated fields per locale.
///
/// Translated fields are skipped by the plain property writer at flush;
/// the strategy registered under the class mapping's translator key owns
/// them instead. All operations address the same (node, mapping, locale)
/// tuple; the field map is keyed by storage property, matching the
/// flattened form the unit of work produces.
pub trait TranslationStrategy {
    /// Write translated field values for a locale.
    fn save_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        fields: &BTreeMap<String, PropertyValue>,
        locale: &str,
    ) -> OdmResult<()>;

    /// Read translated field values for a locale. `Ok(None)` when the
    /// node carries no translation for that locale.
    fn load_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        locale: &str,
    ) -> OdmResult<Option<BTreeMap<String, PropertyValue>>>;

    /// Remove one locale's translation.
    fn remove_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        locale: &str,
    ) -> OdmResult<()>;

    /// Remove every persisted translation.
    fn remove_all_translations(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
    ) -> OdmResult<()>;

    /// Locales for which a translation is persisted.
    fn locales_for(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
    ) -> OdmResult<Vec<String>>;
}

/// Chooses the effective locale when a translated document is flushed
/// without an explicitly bound locale.
pub trait LocaleChooser {
    /// The locale used when none is bound.
    fn default_locale(&self) -> &str;

    /// Load-order fallback chain for a requested locale. The requested
    /// locale itself comes first.
    fn fallback(&self, requested: &str) -> Vec<String> {
        vec![requested.to_string()]
    }
}

/// Fixed-default locale chooser with an optional fallback chain.
#[derive(Clone, Debug)]
pub struct DefaultLocaleChooser {
    default: String,
    fallbacks: BTreeMap<String, Vec<String>>,
}

impl DefaultLocaleChooser {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            fallbacks: BTreeMap::new(),
        }
    }

    /// Declare the fallback chain consulted after `locale` itself.
    pub fn with_fallback(
        mut self,
        locale: impl Into<String>,
        chain: Vec<String>,
    ) -> Self {
        self.fallbacks.insert(locale.into(), chain);
        self
    }
}

impl LocaleChooser for DefaultLocaleChooser {
    fn default_locale(&self) -> &str {
        &self.default
    }

    fn fallback(&self, requested: &str) -> Vec<String> {
        let mut chain = vec![requested.to_string()];
        if let Some(rest) = self.fallbacks.get(requested) {
            chain.extend(rest.iter().cloned());
        }
        chain
    }
}

/// Stores translations as prefixed properties on the translated node
/// itself: `{prefix}:{locale}:{property}`.
#[derive(Clone, Debug)]
pub struct AttributeTranslationStrategy {
    prefix: String,
}

impl AttributeTranslationStrategy {
    /// The conventional property prefix.
    pub const DEFAULT_PREFIX: &'static str = "canopy:t";

    pub fn new() -> Self {
        Self {
            prefix: Self::DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn property_name(&self, locale: &str, property: &str) -> String {
        format!("{}:{locale}:{property}", self.prefix)
    }

    fn translated_properties<'a>(&self, mapping: &'a ClassMapping) -> Vec<&'a str> {
        mapping
            .fields
            .iter()
            .filter(|f| f.translated)
            .map(|f| f.property.as_str())
            .collect()
    }
}

impl Default for AttributeTranslationStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationStrategy for AttributeTranslationStrategy {
    fn save_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        fields: &BTreeMap<String, PropertyValue>,
        locale: &str,
    ) -> OdmResult<()> {
        for property in self.translated_properties(mapping) {
            if let Some(value) = fields.get(property) {
                session.set_property(
                    path,
                    &self.property_name(locale, property),
                    value.clone(),
                )?;
            }
        }
        Ok(())
    }

    fn load_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        locale: &str,
    ) -> OdmResult<Option<BTreeMap<String, PropertyValue>>> {
        let mut fields = BTreeMap::new();
        for property in self.translated_properties(mapping) {
            if let Some(value) = session.property(path, &self.property_name(locale, property))? {
                fields.insert(property.to_string(), value);
            }
        }
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    fn remove_translation(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
        locale: &str,
    ) -> OdmResult<()> {
        for property in self.translated_properties(mapping) {
            session.remove_property(path, &self.property_name(locale, property))?;
        }
        Ok(())
    }

    fn remove_all_translations(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
    ) -> OdmResult<()> {
        for locale in self.locales_for(session, path, mapping)? {
            self.remove_translation(session, path, mapping, &locale)?;
        }
        Ok(())
    }

    fn locales_for(
        &self,
        session: &dyn NodeSession,
        path: &NodePath,
        mapping: &ClassMapping,
    ) -> OdmResult<Vec<String>> {
        let Some(node) = session.node(path)? else {
            return Ok(Vec::new());
        };
        let marker = format!("{}:", self.prefix);
        let translated = self.translated_properties(mapping);
        let mut locales = Vec::new();
        for name in node.properties.keys() {
            let Some(rest) = name.strip_prefix(&marker) else {
                continue;
            };
            // rest is "{locale}:{property}"; locales contain no colon.
            let Some((locale, property)) = rest.split_once(':') else {
                continue;
            };
            if translated.contains(&property) && !locales.iter().any(|l| l == locale) {
                locales.push(locale.to_string());
            }
        }
        locales.sort();
        Ok(locales)
    }
}
