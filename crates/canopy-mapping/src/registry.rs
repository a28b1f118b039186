use std::collections::BTreeMap;

use crate::class::ClassMapping;
use crate::error::{MappingError, MappingResult};
use crate::resolver::{TypeResolver, TypeTag};

/// The set of registered class mappings.
///
/// Always contains the generic fallback mapping, so resolution through
/// [`TypeResolver`] can never produce a tag without a mapping.
#[derive(Clone, Debug)]
pub struct MappingRegistry {
    classes: BTreeMap<TypeTag, ClassMapping>,
}

impl MappingRegistry {
    /// A registry holding only the generic fallback mapping.
    pub fn new() -> Self {
        let mut classes = BTreeMap::new();
        let generic = ClassMapping::generic();
        classes.insert(generic.tag.clone(), generic);
        Self { classes }
    }

    /// Register a class mapping. Fails on duplicate tags.
    pub fn register(&mut self, mapping: ClassMapping) -> MappingResult<()> {
        if self.classes.contains_key(&mapping.tag) && !mapping.tag.is_generic() {
            return Err(MappingError::DuplicateClass(mapping.tag));
        }
        self.classes.insert(mapping.tag.clone(), mapping);
        Ok(())
    }

    /// Look up the mapping for a tag.
    pub fn get(&self, tag: &TypeTag) -> MappingResult<&ClassMapping> {
        self.classes
            .get(tag)
            .ok_or_else(|| MappingError::UnknownClass(tag.clone()))
    }

    /// Returns `true` if a mapping is registered for the tag.
    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.classes.contains_key(tag)
    }

    /// Number of registered classes, including the generic fallback.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if only the generic fallback is registered.
    pub fn is_empty(&self) -> bool {
        self.classes.len() <= 1
    }

    /// Build a resolver over the registered tags.
    pub fn resolver(&self) -> TypeResolver {
        TypeResolver::new(self.classes.keys().cloned())
    }
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassMapping;

    #[test]
    fn new_registry_has_generic() {
        let registry = MappingRegistry::new();
        assert!(registry.contains(&TypeTag::generic()));
        assert!(registry.is_empty());
        assert!(registry.get(&TypeTag::generic()).is_ok());
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = MappingRegistry::new();
        let tag = TypeTag::new("app.Article");
        registry
            .register(ClassMapping::of(tag.clone(), "app:article"))
            .unwrap();
        assert_eq!(registry.get(&tag).unwrap().node_type, "app:article");
        assert!(!registry.is_empty());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = MappingRegistry::new();
        let tag = TypeTag::new("app.Article");
        registry
            .register(ClassMapping::of(tag.clone(), "app:article"))
            .unwrap();
        let err = registry
            .register(ClassMapping::of(tag.clone(), "app:other"))
            .unwrap_err();
        assert_eq!(err, MappingError::DuplicateClass(tag));
    }

    #[test]
    fn unknown_lookup_fails() {
        let registry = MappingRegistry::new();
        let err = registry.get(&TypeTag::new("nope")).unwrap_err();
        assert!(matches!(err, MappingError::UnknownClass(_)));
    }

    #[test]
    fn resolver_covers_registered_tags() {
        let mut registry = MappingRegistry::new();
        let tag = TypeTag::new("app.Article");
        registry
            .register(ClassMapping::of(tag.clone(), "app:article"))
            .unwrap();
        let resolver = registry.resolver();
        assert_eq!(resolver.resolve("app.Article"), tag);
        assert!(resolver.resolve("unknown.Class").is_generic());
    }
}
