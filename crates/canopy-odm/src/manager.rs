use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;

use canopy_collections::{ChildrenCollection, ReferenceManyCollection};
use canopy_mapping::MappingRegistry;
use canopy_store::NodeSession;
use canopy_types::{DocumentHandle, DocumentState, NodePath};

use crate::document::{Document, Reference};
use crate::error::{OdmError, OdmResult};
use crate::events::{EventDispatcher, LifecycleEvent};
use crate::translation::{LocaleChooser, TranslationStrategy};
use crate::unit_of_work::{UnitOfWork, UowContext};

/// The public face of a Canopy session: one unit of work over one backing
/// store session.
///
/// A manager is explicitly constructed and explicitly passed; there is no
/// ambient instance. It serves one logical session and is not safe for
/// concurrent use from multiple threads of control. After a failed commit
/// the manager is closed: every operation returns
/// [`OdmError::ManagerClosed`] and the caller must build a new manager.
pub struct DocumentManager {
    session: Arc<dyn NodeSession>,
    mappings: MappingRegistry,
    events: EventDispatcher,
    translations: BTreeMap<String, Box<dyn TranslationStrategy>>,
    locale_chooser: Option<Box<dyn LocaleChooser>>,
    uow: UnitOfWork,
}

impl DocumentManager {
    pub fn new(session: Arc<dyn NodeSession>, mappings: MappingRegistry) -> Self {
        Self {
            session,
            mappings,
            events: EventDispatcher::new(),
            translations: BTreeMap::new(),
            locale_chooser: None,
            uow: UnitOfWork::new(),
        }
    }

    /// Register a translation strategy under the key class mappings refer
    /// to via their translator field.
    pub fn add_translation_strategy(
        &mut self,
        key: impl Into<String>,
        strategy: impl TranslationStrategy + 'static,
    ) {
        self.translations.insert(key.into(), Box::new(strategy));
    }

    pub fn set_locale_chooser(&mut self, chooser: impl LocaleChooser + 'static) {
        self.locale_chooser = Some(Box::new(chooser));
    }

    /// Subscribe to all lifecycle events.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(LifecycleEvent, Option<DocumentHandle>) + 'static,
    {
        self.events.subscribe(listener);
    }

    /// Subscribe to one lifecycle event.
    pub fn on<F>(&mut self, event: LifecycleEvent, listener: F)
    where
        F: Fn(Option<DocumentHandle>) + 'static,
    {
        self.events.on(event, listener);
    }

    pub fn session(&self) -> &dyn NodeSession {
        self.session.as_ref()
    }

    pub fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    fn with_uow<T>(
        &mut self,
        f: impl FnOnce(&mut UnitOfWork, &UowContext<'_>) -> OdmResult<T>,
    ) -> OdmResult<T> {
        let ctx = UowContext {
            session: self.session.as_ref(),
            mappings: &self.mappings,
            events: &self.events,
            translations: &self.translations,
            locale_chooser: self.locale_chooser.as_deref(),
        };
        f(&mut self.uow, &ctx)
    }

    // ---------------------------------------------------------------
    // Document access
    // ---------------------------------------------------------------

    /// Bring an application-created document under management as `New`.
    pub fn create(&mut self, document: Document) -> DocumentHandle {
        self.uow.allocate(document)
    }

    pub fn document(&self, handle: DocumentHandle) -> OdmResult<&Document> {
        self.uow
            .registry()
            .document(handle)
            .ok_or(OdmError::UnknownHandle(handle))
    }

    pub fn document_mut(&mut self, handle: DocumentHandle) -> OdmResult<&mut Document> {
        self.uow
            .registry_mut()
            .document_mut(handle)
            .ok_or(OdmError::UnknownHandle(handle))
    }

    /// The document's identifier, once assigned.
    pub fn id_of(&self, handle: DocumentHandle) -> Option<NodePath> {
        self.uow
            .registry()
            .document(handle)
            .and_then(|d| d.id.clone())
    }

    pub fn state_of(&self, handle: DocumentHandle) -> Option<DocumentState> {
        self.uow.registry().state(handle)
    }

    /// Tracked and not scheduled for removal.
    pub fn contains(&self, handle: DocumentHandle) -> bool {
        self.uow.contains(handle)
    }

    pub fn is_open(&self) -> bool {
        !self.uow.is_closed()
    }

    /// Close the manager. All further operations fail.
    pub fn close(&mut self) {
        self.uow.close();
    }

    // ---------------------------------------------------------------
    // Core operations
    // ---------------------------------------------------------------

    pub fn find(&mut self, path: &NodePath) -> OdmResult<Option<DocumentHandle>> {
        self.with_uow(|uow, ctx| uow.find(ctx, path))
    }

    pub fn find_many(&mut self, paths: &[NodePath]) -> OdmResult<Vec<Option<DocumentHandle>>> {
        self.with_uow(|uow, ctx| uow.find_many(ctx, paths))
    }

    pub fn persist(&mut self, handle: DocumentHandle) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.schedule_insert(ctx, handle))
    }

    pub fn remove(&mut self, handle: DocumentHandle) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.schedule_remove(ctx, handle))
    }

    /// Schedule an explicit move to `target`, applied at commit.
    pub fn move_document(&mut self, handle: DocumentHandle, target: NodePath) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.schedule_move(ctx, handle, target))
    }

    /// Schedule a reorder of child `name` relative to sibling `target`.
    pub fn reorder(
        &mut self,
        parent: DocumentHandle,
        name: impl Into<String>,
        target: impl Into<String>,
        before: bool,
    ) -> OdmResult<()> {
        let (name, target) = (name.into(), target.into());
        self.with_uow(|uow, ctx| uow.schedule_reorder(ctx, parent, name, target, before))
    }

    pub fn merge(&mut self, handle: DocumentHandle) -> OdmResult<DocumentHandle> {
        self.with_uow(|uow, ctx| uow.merge(ctx, handle))
    }

    pub fn detach(&mut self, handle: DocumentHandle) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.detach(ctx, handle))
    }

    pub fn refresh(&mut self, handle: DocumentHandle) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.refresh(ctx, handle))
    }

    /// Flush all managed documents.
    pub fn commit(&mut self) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.commit(ctx, None))
    }

    /// Flush the given documents (plus anything reachable through the
    /// insert queue).
    pub fn commit_documents(&mut self, handles: &[DocumentHandle]) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.commit(ctx, Some(handles)))
    }

    /// Forget every tracked document and all pending work.
    pub fn clear(&mut self) -> OdmResult<()> {
        self.with_uow(|uow, ctx| uow.clear(ctx))
    }

    // ---------------------------------------------------------------
    // Association access
    // ---------------------------------------------------------------

    /// Materialize and read a mapped children collection.
    pub fn children(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Vec<(String, DocumentHandle)>> {
        self.with_uow(|uow, ctx| {
            uow.ensure_children_loaded(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .children
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no children association {assoc:?}")))?;
            Ok(collection.iter().map(|(k, v)| (k.clone(), v)).collect())
        })
    }

    /// Child count without materializing the children (uses the cached
    /// name listing).
    pub fn child_count(&mut self, handle: DocumentHandle, assoc: &str) -> OdmResult<usize> {
        self.with_uow(|uow, ctx| {
            uow.ensure_child_names(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .children
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no children association {assoc:?}")))?;
            Ok(collection.count_hint().unwrap_or(0))
        })
    }

    /// Key membership without materializing the children.
    pub fn has_child(&mut self, handle: DocumentHandle, assoc: &str, key: &str) -> OdmResult<bool> {
        self.with_uow(|uow, ctx| {
            uow.ensure_child_names(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .children
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no children association {assoc:?}")))?;
            Ok(collection.contains_key_hint(key).unwrap_or(false))
        })
    }

    /// A positional window of child keys without materializing children.
    pub fn children_slice(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
        offset: usize,
        len: usize,
    ) -> OdmResult<Vec<String>> {
        self.with_uow(|uow, ctx| {
            uow.ensure_child_names(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .children
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no children association {assoc:?}")))?;
            Ok(collection.slice_hint(offset, len).unwrap_or_default())
        })
    }

    /// Add a child under a mapped children association.
    pub fn add_child(
        &mut self,
        parent: DocumentHandle,
        assoc: &str,
        name: impl Into<String>,
        child: DocumentHandle,
    ) -> OdmResult<()> {
        let name = name.into();
        if self.state_of(parent) == Some(DocumentState::Managed) {
            self.with_uow(|uow, ctx| uow.ensure_children_loaded(ctx, parent, assoc))?;
        }
        let document = self.document_mut(parent)?;
        let collection = document
            .children
            .entry(assoc.to_string())
            .or_insert_with(|| ChildrenCollection::from_items(IndexMap::new()));
        collection.insert(name, child);
        Ok(())
    }

    /// Remove a child (by key) from a mapped children association. The
    /// child document itself is scheduled for removal at commit.
    pub fn remove_child(
        &mut self,
        parent: DocumentHandle,
        assoc: &str,
        name: &str,
    ) -> OdmResult<Option<DocumentHandle>> {
        if self.state_of(parent) == Some(DocumentState::Managed) {
            self.with_uow(|uow, ctx| uow.ensure_children_loaded(ctx, parent, assoc))?;
        }
        let document = self.document_mut(parent)?;
        let collection = document
            .children
            .get_mut(assoc)
            .ok_or_else(|| OdmError::InvalidArgument(format!("no children association {assoc:?}")))?;
        Ok(collection.remove(name))
    }

    /// Materialize a lazy single-child association.
    pub fn child(&mut self, handle: DocumentHandle, assoc: &str) -> OdmResult<Option<DocumentHandle>> {
        self.with_uow(|uow, ctx| uow.ensure_child_loaded(ctx, handle, assoc))
    }

    /// Dereference a single-document reference, loading it if needed.
    pub fn reference(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Option<DocumentHandle>> {
        self.with_uow(|uow, ctx| uow.ensure_reference_loaded(ctx, handle, assoc))
    }

    /// Point a single-document reference at `target` (or clear it).
    pub fn set_reference(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
        target: Option<DocumentHandle>,
    ) -> OdmResult<()> {
        let document = self.document_mut(handle)?;
        match target {
            Some(target) => {
                document
                    .references
                    .insert(assoc.to_string(), Reference::Loaded(target));
            }
            None => {
                document.references.remove(assoc);
            }
        }
        Ok(())
    }

    /// Materialize and read a multi-reference collection.
    pub fn references(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Vec<DocumentHandle>> {
        self.with_uow(|uow, ctx| {
            uow.ensure_references_loaded(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .many_references
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no reference association {assoc:?}")))?;
            Ok(collection.handles().to_vec())
        })
    }

    /// Append a target to a multi-reference collection.
    pub fn add_reference(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
        target: DocumentHandle,
    ) -> OdmResult<()> {
        if self.state_of(handle) == Some(DocumentState::Managed) {
            self.with_uow(|uow, ctx| uow.ensure_references_loaded(ctx, handle, assoc))?;
        }
        let document = self.document_mut(handle)?;
        let collection = document
            .many_references
            .entry(assoc.to_string())
            .or_insert_with(|| ReferenceManyCollection::from_items(Vec::new()));
        collection.add(target);
        Ok(())
    }

    /// Materialize and read a referrers collection.
    pub fn referrers(
        &mut self,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Vec<DocumentHandle>> {
        self.with_uow(|uow, ctx| {
            uow.ensure_referrers_loaded(ctx, handle, assoc)?;
            let document = uow
                .registry()
                .document(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document
                .referrers
                .get(assoc)
                .ok_or_else(|| OdmError::InvalidArgument(format!("no referrers association {assoc:?}")))?;
            Ok(collection.handles().to_vec())
        })
    }

    /// Enumerate and load child documents directly from the store,
    /// bypassing any mapped association. `filter` restricts by name
    /// prefix.
    pub fn get_children(
        &mut self,
        handle: DocumentHandle,
        filter: Option<&str>,
    ) -> OdmResult<Vec<(String, DocumentHandle)>> {
        self.with_uow(|uow, ctx| {
            let id = uow
                .registry()
                .document(handle)
                .and_then(|d| d.id.clone())
                .ok_or(OdmError::NotManaged(handle))?;
            let names = ctx.session.child_names(&id, filter)?;
            let mut out = Vec::new();
            for name in names {
                let child_path = id.join(&name)?;
                if let Some(child) = uow.find(ctx, &child_path)? {
                    out.push((name, child));
                }
            }
            Ok(out)
        })
    }

    /// Look up and load the documents referencing this one, bypassing any
    /// mapped association. `property` restricts by referencing property.
    pub fn get_referrers(
        &mut self,
        handle: DocumentHandle,
        property: Option<&str>,
    ) -> OdmResult<Vec<DocumentHandle>> {
        self.with_uow(|uow, ctx| {
            let id = uow
                .registry()
                .document(handle)
                .and_then(|d| d.id.clone())
                .ok_or(OdmError::NotManaged(handle))?;
            let paths = ctx.session.referrers(&id, property)?;
            let mut out = Vec::new();
            for path in paths {
                if let Some(referrer) = uow.find(ctx, &path)? {
                    out.push(referrer);
                }
            }
            Ok(out)
        })
    }

    // ---------------------------------------------------------------
    // Translations
    // ---------------------------------------------------------------

    /// Load a persisted translation in place and bind the locale.
    pub fn bind_translation(&mut self, handle: DocumentHandle, locale: &str) -> OdmResult<bool> {
        self.with_uow(|uow, ctx| uow.bind_translation(ctx, handle, locale))
    }

    /// Locales with a persisted translation for this document.
    pub fn locales_for(&mut self, handle: DocumentHandle) -> OdmResult<Vec<String>> {
        self.with_uow(|uow, ctx| uow.locales_for(ctx, handle))
    }
}

impl std::fmt::Debug for DocumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentManager")
            .field("open", &self.is_open())
            .field("uow", &self.uow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use canopy_mapping::{
        AssociationMapping, Cascade, ClassMapping, FieldMapping, IdStrategy, TypeTag, Versioning,
    };
    use canopy_store::InMemoryNodeSession;
    use canopy_types::PropertyValue;

    use crate::translation::{AttributeTranslationStrategy, DefaultLocaleChooser};
    use crate::unit_of_work::{CLASS_PROPERTY, MANAGED_MIXIN, VERSIONABLE_MIXIN};

    fn p(s: &str) -> NodePath {
        NodePath::new(s).unwrap()
    }

    fn folder_tag() -> TypeTag {
        TypeTag::new("test.Folder")
    }

    fn article_tag() -> TypeTag {
        TypeTag::new("test.Article")
    }

    fn post_tag() -> TypeTag {
        TypeTag::new("test.Post")
    }

    fn target_tag() -> TypeTag {
        TypeTag::new("test.Target")
    }

    fn mappings() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                ClassMapping::of(folder_tag(), "test:folder")
                    .with_association(AssociationMapping::parent("parent"))
                    .with_association(AssociationMapping::children("items", Cascade::owned())),
            )
            .unwrap();
        registry
            .register(
                ClassMapping::of(article_tag(), "test:article")
                    .with_field(FieldMapping::new("title", "test:title"))
                    .with_field(FieldMapping::new("tags", "test:tags").multivalue())
                    .with_association(AssociationMapping::parent("parent"))
                    .with_association(AssociationMapping::child("summary", Cascade::persist()))
                    .with_association(AssociationMapping::reference_one(
                        "author",
                        "test:author",
                        Cascade::none(),
                    ))
                    .with_association(AssociationMapping::reference_many(
                        "links",
                        "test:links",
                        Cascade::persist(),
                    ))
                    .with_id_strategy(IdStrategy::ParentAndName),
            )
            .unwrap();
        registry
            .register(
                ClassMapping::of(post_tag(), "test:post")
                    .with_field(FieldMapping::new("title", "test:title"))
                    .with_field(FieldMapping::new("body", "test:body").translated())
                    .with_translator("attribute")
                    .with_versioning(Versioning::Simple),
            )
            .unwrap();
        registry
            .register(
                ClassMapping::of(target_tag(), "test:target")
                    .with_association(AssociationMapping::referrers("backlinks", None)),
            )
            .unwrap();
        registry
    }

    fn manager() -> (Arc<InMemoryNodeSession>, DocumentManager) {
        let session = Arc::new(InMemoryNodeSession::new());
        let mut mgr = DocumentManager::new(session.clone(), mappings());
        mgr.add_translation_strategy("attribute", AttributeTranslationStrategy::new());
        mgr.set_locale_chooser(DefaultLocaleChooser::new("en"));
        (session, mgr)
    }

    /// Create a bare node directly in the store, optionally stamped with
    /// a class so loads resolve a specific mapping.
    fn seed_node(session: &InMemoryNodeSession, path: &str, class: Option<&TypeTag>) -> NodePath {
        let path = p(path);
        session
            .create_node(&path.parent().unwrap(), path.name(), "test:seeded")
            .unwrap();
        if let Some(class) = class {
            session
                .set_property(&path, CLASS_PROPERTY, PropertyValue::from(class.as_str()))
                .unwrap();
        }
        path
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    #[test]
    fn find_returns_same_instance_for_same_id() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/doc", None);
        let first = mgr.find(&p("/doc")).unwrap().unwrap();
        let second = mgr.find(&p("/doc")).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn find_miss_is_absence_not_error() {
        let (_session, mut mgr) = manager();
        assert!(mgr.find(&p("/missing")).unwrap().is_none());
    }

    #[test]
    fn find_many_mixes_hits_and_misses() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/one", None);
        let results = mgr.find_many(&[p("/one"), p("/two")]).unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    // -----------------------------------------------------------------------
    // Persist and commit
    // -----------------------------------------------------------------------

    #[test]
    fn persist_twice_creates_one_node() {
        let (session, mut mgr) = manager();
        let doc = Document::new(folder_tag()).with_id(p("/f"));
        let h = mgr.create(doc);
        mgr.persist(h).unwrap();
        mgr.persist(h).unwrap();
        mgr.commit().unwrap();
        // Root plus exactly one created node.
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn end_to_end_persist_then_remove() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/parent")));
        mgr.persist(folder).unwrap();
        mgr.commit().unwrap();

        let article = mgr.create(
            Document::new(article_tag())
                .with_node_name("d")
                .with_field("title", "hello"),
        );
        mgr.document_mut(article).unwrap().parent = Some(folder);
        mgr.persist(article).unwrap();
        assert_eq!(mgr.state_of(article), Some(DocumentState::Managed));
        assert_eq!(mgr.id_of(article), Some(p("/parent/d")));
        mgr.commit().unwrap();

        let node = session.node(&p("/parent/d")).unwrap().unwrap();
        assert_eq!(
            node.property(CLASS_PROPERTY).unwrap().as_str(),
            Some("test.Article")
        );
        assert!(node.has_mixin(MANAGED_MIXIN));
        assert_eq!(
            node.property("test:title").unwrap().as_str(),
            Some("hello")
        );
        assert!(mgr.contains(article));

        mgr.remove(article).unwrap();
        mgr.commit().unwrap();
        assert!(mgr.find(&p("/parent/d")).unwrap().is_none());
        assert!(!mgr.contains(article));
        assert!(session.node(&p("/parent/d")).unwrap().is_none());
    }

    #[test]
    fn cascade_persists_children_with_parent_first() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        for name in ["a", "b", "c"] {
            let child = mgr.create(Document::new(article_tag()).with_field("title", name));
            mgr.add_child(folder, "items", name, child).unwrap();
        }
        mgr.persist(folder).unwrap();
        mgr.commit().unwrap();

        // Parent plus three children; child creation would have failed if
        // the parent node did not exist first.
        assert!(session.node(&p("/f")).unwrap().is_some());
        assert_eq!(session.child_names(&p("/f"), None).unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn unpersisted_reference_without_cascade_fails_before_io() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(folder).unwrap();
        mgr.commit().unwrap();

        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        let loose = mgr.create(Document::new(folder_tag()).with_id(p("/loose")));
        mgr.set_reference(article, "author", Some(loose)).unwrap();
        mgr.persist(article).unwrap();

        let nodes_before = session.len();
        let err = mgr.commit().unwrap_err();
        assert!(matches!(err, OdmError::CascadePersistRequired { .. }));
        // Validation failed before any store write.
        assert_eq!(session.len(), nodes_before);
        // Validation errors do not close the manager.
        assert!(mgr.is_open());
    }

    #[test]
    fn reference_many_cascades_and_defers_property_write() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(folder).unwrap();

        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        let l1 = mgr.create(Document::new(folder_tag()).with_id(p("/linked1")));
        let l2 = mgr.create(Document::new(folder_tag()).with_id(p("/linked2")));
        mgr.add_reference(article, "links", l1).unwrap();
        mgr.add_reference(article, "links", l2).unwrap();
        mgr.persist(article).unwrap();
        mgr.commit().unwrap();

        assert!(session.node(&p("/linked1")).unwrap().is_some());
        assert!(session.node(&p("/linked2")).unwrap().is_some());
        let links = session.property(&p("/f/a"), "test:links").unwrap().unwrap();
        assert_eq!(
            links,
            PropertyValue::Multi(vec![
                PropertyValue::Path(p("/linked1")),
                PropertyValue::Path(p("/linked2")),
            ])
        );
    }

    #[test]
    fn cleared_reference_removes_property() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        let author = mgr.create(Document::new(folder_tag()).with_id(p("/author")));
        mgr.persist(folder).unwrap();
        mgr.persist(author).unwrap();

        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        mgr.set_reference(article, "author", Some(author)).unwrap();
        mgr.persist(article).unwrap();
        mgr.commit().unwrap();
        assert!(session.property(&p("/f/a"), "test:author").unwrap().is_some());

        mgr.set_reference(article, "author", None).unwrap();
        mgr.commit().unwrap();
        assert!(session.property(&p("/f/a"), "test:author").unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Illegal mutations
    // -----------------------------------------------------------------------

    #[test]
    fn child_reassignment_is_rejected_at_commit() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(folder).unwrap();
        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        let summary = mgr.create(Document::new(TypeTag::generic()));
        mgr.document_mut(article)
            .unwrap()
            .singles
            .insert("summary".into(), summary);
        mgr.persist(article).unwrap();
        mgr.commit().unwrap();
        assert!(session.node(&p("/f/a/summary")).unwrap().is_some());

        let imposter = mgr.create(Document::new(TypeTag::generic()));
        mgr.document_mut(article)
            .unwrap()
            .singles
            .insert("summary".into(), imposter);
        let nodes_before = session.len();
        let err = mgr.commit().unwrap_err();
        assert!(matches!(err, OdmError::IllegalChildReassignment { .. }));
        assert_eq!(session.len(), nodes_before);
    }

    #[test]
    fn identifier_mutation_is_rejected() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/stable", None);
        let h = mgr.find(&p("/stable")).unwrap().unwrap();
        mgr.document_mut(h).unwrap().id = Some(p("/hijacked"));
        let err = mgr.commit().unwrap_err();
        assert!(matches!(err, OdmError::ImmutableIdentifier { .. }));
    }

    #[test]
    fn detached_document_cannot_be_persisted() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/d", None);
        let h = mgr.find(&p("/d")).unwrap().unwrap();
        mgr.detach(h).unwrap();
        assert!(matches!(
            mgr.persist(h).unwrap_err(),
            OdmError::DetachedDocument(_)
        ));
    }

    // -----------------------------------------------------------------------
    // Dirty checking
    // -----------------------------------------------------------------------

    #[test]
    fn change_set_is_not_retriggered_by_its_own_computation() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/doc", None);
        let updates = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&updates);
        mgr.on(LifecycleEvent::PostUpdate, move |_| {
            *counter.borrow_mut() += 1;
        });

        let h = mgr.find(&p("/doc")).unwrap().unwrap();
        mgr.document_mut(h).unwrap().set_field("x", 1i64);
        mgr.commit().unwrap();
        assert_eq!(*updates.borrow(), 1);

        // No mutation since the flush: the second commit is a no-op.
        mgr.commit().unwrap();
        assert_eq!(*updates.borrow(), 1);
    }

    #[test]
    fn unchanged_fields_are_dropped_from_the_diff() {
        let (session, mut mgr) = manager();
        let path = seed_node(&session, "/doc", None);
        session
            .set_property(&path, "kept", PropertyValue::from("same"))
            .unwrap();
        let h = mgr.find(&path).unwrap().unwrap();
        mgr.document_mut(h).unwrap().set_field("extra", 5i64);
        mgr.commit().unwrap();

        // The untouched property was not rewritten; the new one was.
        assert_eq!(
            session.property(&path, "kept").unwrap().unwrap(),
            PropertyValue::from("same")
        );
        assert_eq!(
            session.property(&path, "extra").unwrap().unwrap(),
            PropertyValue::from(5i64)
        );
    }

    // -----------------------------------------------------------------------
    // Children collections and reordering
    // -----------------------------------------------------------------------

    fn folder_with_children(names: &[&str]) -> (Arc<InMemoryNodeSession>, DocumentManager, DocumentHandle) {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        for name in names {
            let child = mgr.create(Document::new(article_tag()).with_field("title", *name));
            mgr.add_child(folder, "items", *name, child).unwrap();
        }
        mgr.persist(folder).unwrap();
        mgr.commit().unwrap();
        (session, mgr, folder)
    }

    #[test]
    fn collection_reorder_replays_to_the_store() {
        let (session, mut mgr, folder) = folder_with_children(&["a", "b", "c", "d"]);
        {
            let doc = mgr.document_mut(folder).unwrap();
            let items = doc.children.get_mut("items").unwrap();
            // [a,b,c,d] -> [b,a,d,c]
            items.move_before("b", Some("a"));
            items.move_before("d", Some("c"));
            assert_eq!(items.keys(), ["b", "a", "d", "c"]);
        }
        mgr.commit().unwrap();
        assert_eq!(
            session.child_names(&p("/f"), None).unwrap(),
            ["b", "a", "d", "c"]
        );
    }

    #[test]
    fn collection_key_removal_removes_the_child_document() {
        let (session, mut mgr, folder) = folder_with_children(&["a", "b"]);
        mgr.remove_child(folder, "items", "a").unwrap();
        mgr.commit().unwrap();
        assert!(session.node(&p("/f/a")).unwrap().is_none());
        assert!(session.node(&p("/f/b")).unwrap().is_some());
    }

    #[test]
    fn collection_insertion_persists_new_child() {
        let (session, mut mgr, folder) = folder_with_children(&["a"]);
        let fresh = mgr.create(Document::new(article_tag()).with_field("title", "b"));
        mgr.add_child(folder, "items", "b", fresh).unwrap();
        mgr.commit().unwrap();
        assert!(session.node(&p("/f/b")).unwrap().is_some());
    }

    #[test]
    fn explicit_reorder_before_and_after() {
        let (session, mut mgr, folder) = folder_with_children(&["a", "b", "c"]);
        mgr.reorder(folder, "c", "a", true).unwrap();
        mgr.commit().unwrap();
        assert_eq!(session.child_names(&p("/f"), None).unwrap(), ["c", "a", "b"]);

        mgr.reorder(folder, "a", "b", false).unwrap();
        mgr.commit().unwrap();
        assert_eq!(session.child_names(&p("/f"), None).unwrap(), ["c", "b", "a"]);
    }

    #[test]
    fn reorder_invalidates_loaded_collections() {
        let (_session, mut mgr, folder) = folder_with_children(&["a", "b", "c"]);
        // Materialize, then reorder behind the collection's back.
        mgr.children(folder, "items").unwrap();
        mgr.reorder(folder, "c", "a", true).unwrap();
        mgr.commit().unwrap();
        // The collection re-fetches the corrected order.
        let keys: Vec<String> = mgr
            .children(folder, "items")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["c", "a", "b"]);
    }

    #[test]
    fn child_count_does_not_materialize_children() {
        let (session, mut mgr, _folder) = folder_with_children(&["a", "b", "c"]);
        drop(mgr);
        // Fresh manager so nothing is cached.
        let mut mgr = DocumentManager::new(session.clone(), mappings());
        session
            .set_property(&p("/f"), CLASS_PROPERTY, PropertyValue::from("test.Folder"))
            .unwrap();
        let folder = mgr.find(&p("/f")).unwrap().unwrap();

        assert_eq!(mgr.child_count(folder, "items").unwrap(), 3);
        assert!(mgr.has_child(folder, "items", "b").unwrap());
        assert!(!mgr.has_child(folder, "items", "zz").unwrap());
        assert_eq!(mgr.children_slice(folder, "items", 1, 2).unwrap(), ["b", "c"]);
        let collection = &mgr.document(folder).unwrap().children["items"];
        assert!(!collection.is_initialized());
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    #[test]
    fn move_rewrites_descendant_identifiers() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/a", None);
        seed_node(&session, "/a/b", None);
        seed_node(&session, "/a/b/c", None);
        seed_node(&session, "/x", None);
        let b = mgr.find(&p("/a/b")).unwrap().unwrap();
        let c = mgr.find(&p("/a/b/c")).unwrap().unwrap();

        mgr.move_document(b, p("/x/y")).unwrap();
        mgr.commit().unwrap();

        assert_eq!(mgr.id_of(b), Some(p("/x/y")));
        assert_eq!(mgr.id_of(c), Some(p("/x/y/c")));
        // The old prefix no longer resolves; the new one resolves to the
        // same instances.
        assert!(mgr.find(&p("/a/b/c")).unwrap().is_none());
        assert_eq!(mgr.find(&p("/x/y/c")).unwrap(), Some(c));
        assert!(session.node(&p("/x/y/c")).unwrap().is_some());
    }

    #[test]
    fn assignment_based_rename_becomes_a_move() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/old", None);
        let h = mgr.find(&p("/old")).unwrap().unwrap();
        mgr.document_mut(h).unwrap().node_name = Some("new".into());
        mgr.commit().unwrap();
        assert_eq!(mgr.id_of(h), Some(p("/new")));
        assert!(session.node(&p("/old")).unwrap().is_none());
        assert!(session.node(&p("/new")).unwrap().is_some());
    }

    #[test]
    fn move_to_same_path_is_a_noop() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/same", None);
        let h = mgr.find(&p("/same")).unwrap().unwrap();
        mgr.move_document(h, p("/same")).unwrap();
        mgr.commit().unwrap();
        assert!(session.node(&p("/same")).unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // Commit failure
    // -----------------------------------------------------------------------

    #[test]
    fn failed_save_invalidates_the_manager() {
        let (session, mut mgr) = manager();
        let h = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(h).unwrap();
        session.set_fail_on_save(true);

        let err = mgr.commit().unwrap_err();
        assert!(matches!(err, OdmError::Store(_)));
        assert!(!mgr.is_open());
        // The transaction was rolled back.
        assert!(session.node(&p("/f")).unwrap().is_none());
        // Every further operation reports the closed manager.
        assert!(matches!(
            mgr.find(&p("/f")).unwrap_err(),
            OdmError::ManagerClosed
        ));
        let other = mgr.create(Document::new(folder_tag()).with_id(p("/g")));
        assert!(matches!(
            mgr.persist(other).unwrap_err(),
            OdmError::ManagerClosed
        ));
    }

    // -----------------------------------------------------------------------
    // Detach / refresh / merge / clear
    // -----------------------------------------------------------------------

    #[test]
    fn refresh_discards_in_memory_changes() {
        let (session, mut mgr) = manager();
        let path = seed_node(&session, "/r", None);
        session
            .set_property(&path, "x", PropertyValue::from(1i64))
            .unwrap();
        let h = mgr.find(&path).unwrap().unwrap();
        mgr.document_mut(h).unwrap().set_field("x", 2i64);
        mgr.refresh(h).unwrap();
        assert_eq!(
            mgr.document(h).unwrap().field("x").unwrap().as_long(),
            Some(1)
        );
        // Nothing left to flush.
        mgr.commit().unwrap();
        assert_eq!(
            session.property(&path, "x").unwrap().unwrap(),
            PropertyValue::from(1i64)
        );
    }

    #[test]
    fn merge_folds_detached_state_into_managed_instance() {
        let (session, mut mgr) = manager();
        let path = seed_node(&session, "/m", None);
        session
            .set_property(&path, "x", PropertyValue::from("old"))
            .unwrap();
        let detached = mgr.find(&path).unwrap().unwrap();
        mgr.detach(detached).unwrap();
        mgr.document_mut(detached).unwrap().set_field("x", "new");

        let managed = mgr.merge(detached).unwrap();
        assert_ne!(managed, detached);
        assert!(mgr.contains(managed));
        assert_eq!(
            mgr.document(managed).unwrap().field("x").unwrap().as_str(),
            Some("new")
        );
        mgr.commit().unwrap();
        assert_eq!(
            session.property(&path, "x").unwrap().unwrap(),
            PropertyValue::from("new")
        );
    }

    #[test]
    fn merge_without_identity_fails() {
        let (_session, mut mgr) = manager();
        let h = mgr.create(Document::new(TypeTag::generic()));
        assert!(matches!(
            mgr.merge(h).unwrap_err(),
            OdmError::InvalidArgument(_)
        ));
    }

    #[test]
    fn clear_forgets_all_documents() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/c", None);
        let cleared = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&cleared);
        mgr.on(LifecycleEvent::OnClear, move |_| {
            *flag.borrow_mut() = true;
        });

        let h = mgr.find(&p("/c")).unwrap().unwrap();
        mgr.clear().unwrap();
        assert!(*cleared.borrow());
        assert!(!mgr.contains(h));
        assert!(matches!(
            mgr.document(h).unwrap_err(),
            OdmError::UnknownHandle(_)
        ));
        // The store is untouched and the document can be re-loaded.
        assert!(mgr.find(&p("/c")).unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // References, referrers, lazy loading
    // -----------------------------------------------------------------------

    #[test]
    fn lazy_reference_dereferences_on_access() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        let author = mgr.create(Document::new(folder_tag()).with_id(p("/author")));
        mgr.persist(folder).unwrap();
        mgr.persist(author).unwrap();
        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        mgr.set_reference(article, "author", Some(author)).unwrap();
        mgr.persist(article).unwrap();
        mgr.commit().unwrap();
        drop(mgr);

        // Fresh manager: the reference comes back lazy and resolves on
        // first dereference.
        let mut mgr = DocumentManager::new(session.clone(), mappings());
        let article = mgr.find(&p("/f/a")).unwrap().unwrap();
        assert!(!mgr.document(article).unwrap().references["author"].is_loaded());
        let target = mgr.reference(article, "author").unwrap().unwrap();
        assert_eq!(mgr.id_of(target), Some(p("/author")));
        assert!(mgr.document(article).unwrap().references["author"].is_loaded());
    }

    #[test]
    fn lazy_single_child_materializes_on_access() {
        let (session, mut mgr) = manager();
        let folder = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(folder).unwrap();
        let article = mgr.create(Document::new(article_tag()).with_node_name("a"));
        mgr.document_mut(article).unwrap().parent = Some(folder);
        let summary = mgr.create(Document::new(TypeTag::generic()));
        mgr.document_mut(article)
            .unwrap()
            .singles
            .insert("summary".into(), summary);
        mgr.persist(article).unwrap();
        mgr.commit().unwrap();
        drop(mgr);

        let mut mgr = DocumentManager::new(session.clone(), mappings());
        let article = mgr.find(&p("/f/a")).unwrap().unwrap();
        assert!(mgr.document(article).unwrap().singles.is_empty());
        let child = mgr.child(article, "summary").unwrap().unwrap();
        assert_eq!(mgr.id_of(child), Some(p("/f/a/summary")));
        // A later flush does not mistake the materialized child for a
        // new assignment.
        mgr.commit().unwrap();
        assert!(session.node(&p("/f/a/summary")).unwrap().is_some());
    }

    #[test]
    fn commit_documents_flushes_only_the_given_documents() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/a", None);
        seed_node(&session, "/b", None);
        let a = mgr.find(&p("/a")).unwrap().unwrap();
        let b = mgr.find(&p("/b")).unwrap().unwrap();
        mgr.document_mut(a).unwrap().set_field("x", 1i64);
        mgr.document_mut(b).unwrap().set_field("x", 2i64);
        mgr.commit_documents(&[a]).unwrap();
        assert!(session.property(&p("/a"), "x").unwrap().is_some());
        assert!(session.property(&p("/b"), "x").unwrap().is_none());
        // The excluded document's changes survive to the next full
        // commit.
        mgr.commit().unwrap();
        assert!(session.property(&p("/b"), "x").unwrap().is_some());
    }

    #[test]
    fn referrers_collection_finds_back_references() {
        let (session, mut mgr) = manager();
        let target = seed_node(&session, "/target", Some(&target_tag()));
        let referrer = seed_node(&session, "/referrer", None);
        session
            .set_property(&referrer, "link", PropertyValue::Path(target.clone()))
            .unwrap();

        let h = mgr.find(&target).unwrap().unwrap();
        let found = mgr.referrers(h, "backlinks").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(mgr.id_of(found[0]), Some(referrer));
    }

    #[test]
    fn get_children_honors_name_filter() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/p", None);
        seed_node(&session, "/p/post-1", None);
        seed_node(&session, "/p/post-2", None);
        seed_node(&session, "/p/draft", None);
        let h = mgr.find(&p("/p")).unwrap().unwrap();

        let all = mgr.get_children(h, None).unwrap();
        assert_eq!(all.len(), 3);
        let posts = mgr.get_children(h, Some("post-")).unwrap();
        let names: Vec<String> = posts.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["post-1", "post-2"]);
    }

    #[test]
    fn get_referrers_without_mapped_association() {
        let (session, mut mgr) = manager();
        let target = seed_node(&session, "/t", None);
        let r1 = seed_node(&session, "/r1", None);
        session
            .set_property(&r1, "ref", PropertyValue::Path(target.clone()))
            .unwrap();
        let h = mgr.find(&target).unwrap().unwrap();
        let found = mgr.get_referrers(h, None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(mgr.id_of(found[0]), Some(r1));
    }

    // -----------------------------------------------------------------------
    // Translations and versioning
    // -----------------------------------------------------------------------

    #[test]
    fn translated_fields_flow_through_the_strategy() {
        let (session, mut mgr) = manager();
        let post = mgr.create(
            Document::new(post_tag())
                .with_id(p("/post"))
                .with_field("title", "plain")
                .with_field("body", "english body"),
        );
        mgr.persist(post).unwrap();
        mgr.commit().unwrap();

        // The plain field is a normal property; the translated one lives
        // under the default locale.
        assert!(session.property(&p("/post"), "test:body").unwrap().is_none());
        assert_eq!(
            session
                .property(&p("/post"), "canopy:t:en:test:body")
                .unwrap()
                .unwrap(),
            PropertyValue::from("english body")
        );

        // Bind a new locale and write under it.
        assert!(!mgr.bind_translation(post, "de").unwrap());
        mgr.document_mut(post).unwrap().set_field("body", "deutscher text");
        mgr.commit().unwrap();
        assert_eq!(
            session
                .property(&p("/post"), "canopy:t:de:test:body")
                .unwrap()
                .unwrap(),
            PropertyValue::from("deutscher text")
        );
        assert_eq!(mgr.locales_for(post).unwrap(), ["de", "en"]);

        // Binding back restores the persisted values.
        assert!(mgr.bind_translation(post, "en").unwrap());
        assert_eq!(
            mgr.document(post).unwrap().field("body").unwrap().as_str(),
            Some("english body")
        );
    }

    #[test]
    fn versioned_class_gets_versionable_mixin() {
        let (session, mut mgr) = manager();
        let post = mgr.create(
            Document::new(post_tag())
                .with_id(p("/post"))
                .with_field("body", "b"),
        );
        mgr.persist(post).unwrap();
        mgr.commit().unwrap();
        assert!(session.has_mixin(&p("/post"), VERSIONABLE_MIXIN).unwrap());
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    #[test]
    fn lifecycle_events_fire_in_order() {
        let (_session, mut mgr) = manager();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        mgr.subscribe(move |event, _| sink.borrow_mut().push(event));

        let h = mgr.create(Document::new(folder_tag()).with_id(p("/f")));
        mgr.persist(h).unwrap();
        mgr.commit().unwrap();

        let events = seen.borrow();
        let order: Vec<usize> = [
            LifecycleEvent::PrePersist,
            LifecycleEvent::PreFlush,
            LifecycleEvent::OnFlush,
            LifecycleEvent::PostPersist,
            LifecycleEvent::PostFlush,
        ]
        .iter()
        .map(|e| events.iter().position(|x| x == e).unwrap())
        .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted, "events out of order: {events:?}");
    }

    #[test]
    fn remove_fires_pre_and_post_hooks() {
        let (session, mut mgr) = manager();
        seed_node(&session, "/doomed", None);
        let pre = Rc::new(RefCell::new(0));
        let post = Rc::new(RefCell::new(0));
        let (pre_c, post_c) = (Rc::clone(&pre), Rc::clone(&post));
        mgr.on(LifecycleEvent::PreRemove, move |_| *pre_c.borrow_mut() += 1);
        mgr.on(LifecycleEvent::PostRemove, move |_| *post_c.borrow_mut() += 1);

        let h = mgr.find(&p("/doomed")).unwrap().unwrap();
        mgr.remove(h).unwrap();
        assert_eq!((*pre.borrow(), *post.borrow()), (1, 0));
        mgr.commit().unwrap();
        assert_eq!((*pre.borrow(), *post.borrow()), (1, 1));
    }
}
