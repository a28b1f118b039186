//! The unit of work: change tracking, scheduling, and commit orchestration.
//!
//! One `UnitOfWork` serves one logical session. It owns the document
//! arena ([`DocumentRegistry`]) and the operation queues, computes
//! change sets against load-time snapshots, cascades operations across
//! the document graph, and executes the queues in dependency order inside
//! a best-effort store transaction.
//!
//! Not safe for concurrent use from multiple threads of control: all
//! traversal is synchronous and cycle protection relies on handle-keyed
//! visited sets, not locks.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use canopy_collections::ChildrenCollection;
use canopy_mapping::{
    AssociationKind, ClassMapping, MappingRegistry, TypeTag,
};
use canopy_store::{Node, NodeSession, StoreError};
use canopy_types::{DocumentHandle, DocumentState, NodePath, PropertyValue};

use crate::changeset::ChangeSet;
use crate::document::{Document, Reference};
use crate::error::{OdmError, OdmResult};
use crate::events::{EventDispatcher, LifecycleEvent};
use crate::registry::{DocumentRegistry, OriginalData};
use crate::reorder::insert_before_pairs;
use crate::translation::{LocaleChooser, TranslationStrategy};

/// Property stamped on every created node so a later load can resolve the
/// document class.
pub const CLASS_PROPERTY: &str = "canopy:class";
/// Mixin marking a node as managed by Canopy.
pub const MANAGED_MIXIN: &str = "canopy:managed";
/// Mixin stamped on nodes of versioned classes.
pub const VERSIONABLE_MIXIN: &str = "mix:versionable";

/// Everything the unit of work borrows from the manager for one call.
pub struct UowContext<'a> {
    pub session: &'a dyn NodeSession,
    pub mappings: &'a MappingRegistry,
    pub events: &'a EventDispatcher,
    pub translations: &'a BTreeMap<String, Box<dyn TranslationStrategy>>,
    pub locale_chooser: Option<&'a dyn LocaleChooser>,
}

/// An explicitly scheduled child reordering.
#[derive(Clone, Debug)]
pub struct ScheduledReorder {
    pub parent: DocumentHandle,
    pub name: String,
    pub target: String,
    /// Place before the target; otherwise after it.
    pub before: bool,
}

/// A reference-property write deferred until all referenced nodes exist.
struct DeferredReferenceWrite {
    path: NodePath,
    property: String,
    value: PropertyValue,
}

pub struct UnitOfWork {
    registry: DocumentRegistry,
    inserts: Vec<DocumentHandle>,
    insert_set: BTreeSet<DocumentHandle>,
    updates: BTreeSet<DocumentHandle>,
    removals: Vec<DocumentHandle>,
    orphan_removals: Vec<NodePath>,
    move_targets: BTreeMap<DocumentHandle, NodePath>,
    reorders: Vec<ScheduledReorder>,
    changesets: BTreeMap<DocumentHandle, ChangeSet>,
    computed: BTreeSet<DocumentHandle>,
    closed: bool,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            registry: DocumentRegistry::new(),
            inserts: Vec::new(),
            insert_set: BTreeSet::new(),
            updates: BTreeSet::new(),
            removals: Vec::new(),
            orphan_removals: Vec::new(),
            move_targets: BTreeMap::new(),
            reorders: Vec::new(),
            changesets: BTreeMap::new(),
            computed: BTreeSet::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the unit of work unusable. Every subsequent public operation
    /// fails with [`OdmError::ManagerClosed`].
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn assert_open(&self) -> OdmResult<()> {
        if self.closed {
            Err(OdmError::ManagerClosed)
        } else {
            Ok(())
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DocumentRegistry {
        &mut self.registry
    }

    /// Bring an application-created document into the arena as `New`.
    pub fn allocate(&mut self, document: Document) -> DocumentHandle {
        self.registry.allocate(document)
    }

    /// Tracked and not scheduled for removal.
    pub fn contains(&self, handle: DocumentHandle) -> bool {
        self.registry.contains(handle)
    }

    fn state_of(&self, handle: DocumentHandle) -> OdmResult<DocumentState> {
        self.registry
            .state(handle)
            .ok_or(OdmError::UnknownHandle(handle))
    }

    fn document_of(&self, handle: DocumentHandle) -> OdmResult<&Document> {
        self.registry
            .document(handle)
            .ok_or(OdmError::UnknownHandle(handle))
    }

    fn mapping_of<'a>(
        &self,
        ctx: &UowContext<'a>,
        handle: DocumentHandle,
    ) -> OdmResult<ClassMapping> {
        let tag = self.document_of(handle)?.tag.clone();
        Ok(ctx.mappings.get(&tag)?.clone())
    }

    // =================================================================
    // Loading
    // =================================================================

    /// Resolve a path to a tracked document, loading it from the store on
    /// a miss. Duplicate loads of the same path return the registered
    /// handle, never a second instance.
    pub fn find(&mut self, ctx: &UowContext<'_>, path: &NodePath) -> OdmResult<Option<DocumentHandle>> {
        self.assert_open()?;
        if let Some(handle) = self.registry.lookup(path) {
            if self.state_of(handle)? == DocumentState::Removed {
                return Ok(None);
            }
            return Ok(Some(handle));
        }
        match ctx.session.node(path)? {
            Some(node) => Ok(Some(self.load_document(ctx, node)?)),
            None => Ok(None),
        }
    }

    /// Batch variant of [`UnitOfWork::find`]; misses stay `None`.
    pub fn find_many(
        &mut self,
        ctx: &UowContext<'_>,
        paths: &[NodePath],
    ) -> OdmResult<Vec<Option<DocumentHandle>>> {
        self.assert_open()?;
        // Pre-fetch the not-yet-tracked paths in one batch, then resolve
        // each path through the identity map as usual.
        let missing: Vec<NodePath> = paths
            .iter()
            .filter(|p| self.registry.lookup(p).is_none())
            .cloned()
            .collect();
        let fetched = ctx.session.nodes(&missing)?;
        for node in fetched.into_iter().flatten() {
            if self.registry.lookup(&node.path).is_none() {
                self.load_document(ctx, node)?;
            }
        }
        paths
            .iter()
            .map(|p| {
                Ok(match self.registry.lookup(p) {
                    Some(h) if self.registry.state(h) == Some(DocumentState::Removed) => None,
                    other => other,
                })
            })
            .collect()
    }

    fn load_document(&mut self, ctx: &UowContext<'_>, node: Node) -> OdmResult<DocumentHandle> {
        let stored_class = node
            .property(CLASS_PROPERTY)
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let tag = ctx.mappings.resolver().resolve(stored_class);
        let mapping = ctx.mappings.get(&tag)?.clone();

        let document = self.document_from_node(&node, tag, &mapping);
        let path = node.path.clone();
        let handle = self.registry.allocate(document);
        self.registry.register_id(handle, path)?;
        let snapshot = self.snapshot_with_mapping(handle, &mapping);
        self.registry.set_snapshot(handle, snapshot);
        debug!(path = %node.path, handle = %handle, "document loaded");
        ctx.events.dispatch(LifecycleEvent::PostLoad, Some(handle));
        Ok(handle)
    }

    /// Build the in-memory document for a node, with every association in
    /// its lazy, uninitialized form.
    fn document_from_node(&self, node: &Node, tag: TypeTag, mapping: &ClassMapping) -> Document {
        let mut document = Document::new(tag);
        document.node_name = Some(node.name().to_string());
        document.parent = node.path.parent().and_then(|p| self.registry.lookup(&p));

        if mapping.dynamic {
            for (property, value) in &node.properties {
                if !property.starts_with("canopy:") {
                    document.fields.insert(property.clone(), value.clone());
                }
            }
        } else {
            for field in &mapping.fields {
                if field.version_metadata || field.translated {
                    continue;
                }
                if let Some(value) = node.property(&field.property) {
                    document.fields.insert(field.name.clone(), value.clone());
                }
            }
        }

        for assoc in &mapping.associations {
            match assoc.kind {
                AssociationKind::Parent | AssociationKind::Child => {}
                AssociationKind::Children => {
                    document.children.insert(
                        assoc.name.clone(),
                        ChildrenCollection::new(assoc.filter.clone()),
                    );
                }
                AssociationKind::ReferenceOne => {
                    if let Some(property) = &assoc.property {
                        if let Some(path) = node.property(property).and_then(|v| v.as_path()) {
                            document
                                .references
                                .insert(assoc.name.clone(), Reference::Lazy(path.clone()));
                        }
                    }
                }
                AssociationKind::ReferenceMany => {
                    let paths = assoc
                        .property
                        .as_ref()
                        .and_then(|p| node.property(p))
                        .map(|v| v.referenced_paths().into_iter().cloned().collect())
                        .unwrap_or_default();
                    document.many_references.insert(
                        assoc.name.clone(),
                        canopy_collections::ReferenceManyCollection::new(paths),
                    );
                }
                AssociationKind::Referrers => {
                    document.referrers.insert(
                        assoc.name.clone(),
                        canopy_collections::ReferrersCollection::new(assoc.filter.clone()),
                    );
                }
            }
        }
        document
    }

    // =================================================================
    // Flattening and snapshots
    // =================================================================

    /// Flatten a document's current values into storage properties.
    /// Version-metadata fields are skipped; reference associations are
    /// flattened to path values so they participate in field diffing.
    fn flatten(&self, handle: DocumentHandle, mapping: &ClassMapping) -> BTreeMap<String, PropertyValue> {
        let Some(document) = self.registry.document(handle) else {
            return BTreeMap::new();
        };
        let mut flat = BTreeMap::new();

        if mapping.dynamic {
            for (name, value) in &document.fields {
                flat.insert(name.clone(), value.clone());
            }
        } else {
            for field in &mapping.fields {
                if field.version_metadata {
                    continue;
                }
                if let Some(value) = document.fields.get(&field.name) {
                    flat.insert(field.property.clone(), value.clone());
                }
            }
        }

        for assoc in &mapping.associations {
            let Some(property) = &assoc.property else {
                continue;
            };
            match assoc.kind {
                AssociationKind::ReferenceOne => {
                    let target = document.references.get(&assoc.name).and_then(|r| match r {
                        Reference::Lazy(path) => Some(path.clone()),
                        Reference::Loaded(h) => {
                            self.registry.document(*h).and_then(|d| d.id.clone())
                        }
                    });
                    if let Some(path) = target {
                        flat.insert(property.clone(), PropertyValue::Path(path));
                    }
                }
                AssociationKind::ReferenceMany => {
                    if let Some(collection) = document.many_references.get(&assoc.name) {
                        let paths: Vec<PropertyValue> = if collection.is_initialized() {
                            collection
                                .handles()
                                .iter()
                                .filter_map(|h| {
                                    self.registry.document(*h).and_then(|d| d.id.clone())
                                })
                                .map(PropertyValue::Path)
                                .collect()
                        } else {
                            collection
                                .referenced_paths()
                                .iter()
                                .cloned()
                                .map(PropertyValue::Path)
                                .collect()
                        };
                        flat.insert(property.clone(), PropertyValue::Multi(paths));
                    }
                }
                _ => {}
            }
        }
        flat
    }

    fn build_snapshot(&self, handle: DocumentHandle) -> OriginalData {
        let Some(document) = self.registry.document(handle) else {
            return OriginalData::default();
        };
        OriginalData {
            id: document.id.clone(),
            node_name: document.node_name.clone(),
            parent: document.parent,
            fields: BTreeMap::new(),
            singles: document.singles.clone(),
        }
    }

    fn snapshot_with_mapping(&self, handle: DocumentHandle, mapping: &ClassMapping) -> OriginalData {
        let mut snapshot = self.build_snapshot(handle);
        snapshot.fields = self.flatten(handle, mapping);
        snapshot
    }

    // =================================================================
    // Scheduling: persist
    // =================================================================

    /// Schedule a document (and its persist-cascade closure) for insert.
    pub fn schedule_insert(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<()> {
        self.assert_open()?;
        let mut visited = BTreeSet::new();
        self.schedule_insert_inner(ctx, handle, &mut visited)
    }

    fn schedule_insert_inner(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let state = self.state_of(handle)?;
        match state {
            DocumentState::Detached => return Err(OdmError::DetachedDocument(handle)),
            DocumentState::Removed => {
                // A removed-then-re-persisted document is un-removed.
                self.removals.retain(|h| *h != handle);
                self.registry.set_state(handle, DocumentState::Managed);
                debug!(handle = %handle, "pending removal cancelled by persist");
            }
            DocumentState::Managed => {}
            DocumentState::New => {
                // Parents are persisted before their children.
                if let Some(parent) = self.document_of(handle)?.parent {
                    if self.state_of(parent)? == DocumentState::New {
                        self.schedule_insert_inner(ctx, parent, visited)?;
                    }
                }
                let id = self.assign_identifier(ctx, handle)?;
                ctx.events.dispatch(LifecycleEvent::PrePersist, Some(handle));
                self.registry.register_id(handle, id.clone())?;
                self.inserts.push(handle);
                self.insert_set.insert(handle);
                debug!(handle = %handle, id = %id, "insert scheduled");
            }
        }
        self.cascade_persist(ctx, handle, visited)
    }

    fn cascade_persist(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<()> {
        let mapping = self.mapping_of(ctx, handle)?;
        let parent_id = self.document_of(handle)?.id.clone();

        for assoc in &mapping.associations {
            if !assoc.cascade.persist {
                continue;
            }
            match assoc.kind {
                AssociationKind::Child => {
                    let child = self.document_of(handle)?.singles.get(&assoc.name).copied();
                    if let Some(child) = child {
                        self.adopt_child(handle, child, &parent_id, &assoc.name)?;
                        self.schedule_insert_inner(ctx, child, visited)?;
                    }
                }
                AssociationKind::Children => {
                    let entries: Vec<(String, DocumentHandle)> = self
                        .document_of(handle)?
                        .children
                        .get(&assoc.name)
                        .filter(|c| c.is_initialized())
                        .map(|c| c.iter().map(|(k, v)| (k.clone(), v)).collect())
                        .unwrap_or_default();
                    for (name, child) in entries {
                        self.adopt_child(handle, child, &parent_id, &name)?;
                        self.schedule_insert_inner(ctx, child, visited)?;
                    }
                }
                AssociationKind::ReferenceOne => {
                    let target = self
                        .document_of(handle)?
                        .references
                        .get(&assoc.name)
                        .and_then(Reference::handle);
                    if let Some(target) = target {
                        if self.state_of(target)? == DocumentState::New {
                            self.schedule_insert_inner(ctx, target, visited)?;
                        }
                    }
                }
                AssociationKind::ReferenceMany => {
                    let targets: Vec<DocumentHandle> = self
                        .document_of(handle)?
                        .many_references
                        .get(&assoc.name)
                        .filter(|c| c.is_initialized())
                        .map(|c| c.handles().to_vec())
                        .unwrap_or_default();
                    for target in targets {
                        if self.state_of(target)? == DocumentState::New {
                            self.schedule_insert_inner(ctx, target, visited)?;
                        }
                    }
                }
                AssociationKind::Parent | AssociationKind::Referrers => {}
            }
        }
        Ok(())
    }

    /// Give a hierarchy child its deterministic id `{parent id}/{name}`
    /// before recursing into persist.
    fn adopt_child(
        &mut self,
        parent: DocumentHandle,
        child: DocumentHandle,
        parent_id: &Option<NodePath>,
        name: &str,
    ) -> OdmResult<()> {
        if self.state_of(child)? != DocumentState::New {
            return Ok(());
        }
        let document = self
            .registry
            .document_mut(child)
            .ok_or(OdmError::UnknownHandle(child))?;
        document.parent = Some(parent);
        if document.id.is_none() {
            let parent_id = parent_id
                .as_ref()
                .ok_or_else(|| OdmError::MissingIdentifier("parent has no identifier yet".into()))?;
            let id = parent_id.join(name)?;
            document.node_name = Some(name.to_string());
            document.id = Some(id);
        }
        Ok(())
    }

    fn assign_identifier(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<NodePath> {
        let document = self.document_of(handle)?;
        if let Some(id) = &document.id {
            return Ok(id.clone());
        }
        let mapping = ctx.mappings.get(&document.tag)?;
        match mapping.id_strategy {
            canopy_mapping::IdStrategy::Assigned => Err(OdmError::MissingIdentifier(format!(
                "class {} uses assigned identifiers; set one before persist",
                document.tag
            ))),
            canopy_mapping::IdStrategy::ParentAndName | canopy_mapping::IdStrategy::AutoName => {
                let name = mapping
                    .nodename_field
                    .as_ref()
                    .and_then(|f| document.fields.get(f))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| document.node_name.clone());
                let name = match name {
                    Some(name) => name,
                    None if mapping.id_strategy == canopy_mapping::IdStrategy::AutoName => {
                        uuid::Uuid::new_v4().simple().to_string()
                    }
                    None => {
                        return Err(OdmError::MissingIdentifier(
                            "no node name set and none derivable".into(),
                        ))
                    }
                };
                let parent = document
                    .parent
                    .ok_or_else(|| OdmError::MissingIdentifier("no parent document set".into()))?;
                let parent_id = self
                    .registry
                    .document(parent)
                    .and_then(|d| d.id.clone())
                    .ok_or_else(|| {
                        OdmError::MissingIdentifier("parent has no identifier yet".into())
                    })?;
                let id = parent_id.join(&name)?;
                let document = self
                    .registry
                    .document_mut(handle)
                    .ok_or(OdmError::UnknownHandle(handle))?;
                document.node_name = Some(name);
                Ok(id)
            }
        }
    }

    // =================================================================
    // Scheduling: remove, move, reorder
    // =================================================================

    /// Schedule a document (and its remove-cascade closure) for removal.
    pub fn schedule_remove(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<()> {
        self.assert_open()?;
        let mut visited = BTreeSet::new();
        self.schedule_remove_inner(ctx, handle, &mut visited)
    }

    fn schedule_remove_inner(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let state = self.state_of(handle)?;
        if state == DocumentState::Detached {
            return Err(OdmError::DetachedDocument(handle));
        }
        ctx.events.dispatch(LifecycleEvent::PreRemove, Some(handle));
        match state {
            DocumentState::New => {
                self.inserts.retain(|h| *h != handle);
                self.insert_set.remove(&handle);
            }
            DocumentState::Managed | DocumentState::Removed => {
                self.move_targets.remove(&handle);
                self.reorders.retain(|r| r.parent != handle);
            }
            DocumentState::Detached => unreachable!("rejected above"),
        }
        self.registry.set_state(handle, DocumentState::Removed);
        if !self.removals.contains(&handle) {
            self.removals.push(handle);
        }
        debug!(handle = %handle, "removal scheduled");

        let mapping = self.mapping_of(ctx, handle)?;
        for assoc in &mapping.associations {
            if !assoc.cascade.remove {
                continue;
            }
            for target in self.association_targets(handle, &assoc.name, assoc.kind) {
                self.schedule_remove_inner(ctx, target, visited)?;
            }
        }
        Ok(())
    }

    /// Loaded targets of one association, for cascade traversal.
    fn association_targets(
        &self,
        handle: DocumentHandle,
        name: &str,
        kind: AssociationKind,
    ) -> Vec<DocumentHandle> {
        let Some(document) = self.registry.document(handle) else {
            return Vec::new();
        };
        match kind {
            AssociationKind::Child => document.singles.get(name).copied().into_iter().collect(),
            AssociationKind::Children => document
                .children
                .get(name)
                .filter(|c| c.is_initialized())
                .map(|c| c.iter().map(|(_, v)| v).collect())
                .unwrap_or_default(),
            AssociationKind::ReferenceOne => document
                .references
                .get(name)
                .and_then(Reference::handle)
                .into_iter()
                .collect(),
            AssociationKind::ReferenceMany => document
                .many_references
                .get(name)
                .filter(|c| c.is_initialized())
                .map(|c| c.handles().to_vec())
                .unwrap_or_default(),
            AssociationKind::Referrers => document
                .referrers
                .get(name)
                .filter(|c| c.is_initialized())
                .map(|c| c.handles().to_vec())
                .unwrap_or_default(),
            AssociationKind::Parent => Vec::new(),
        }
    }

    /// Schedule an explicit move to `target`.
    pub fn schedule_move(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        target: NodePath,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let state = self.state_of(handle)?;
        if state == DocumentState::Detached {
            return Err(OdmError::DetachedDocument(handle));
        }
        if state == DocumentState::New {
            // Moves apply only to identified documents.
            self.inserts.retain(|h| *h != handle);
            self.insert_set.remove(&handle);
        }
        if state == DocumentState::Removed {
            // A remove-then-move sequence un-removes.
            self.removals.retain(|h| *h != handle);
            self.registry.set_state(handle, DocumentState::Managed);
        }
        ctx.events.dispatch(LifecycleEvent::PreMove, Some(handle));
        self.move_targets.insert(handle, target);
        Ok(())
    }

    /// Schedule an explicit reorder of `name` relative to `target` among
    /// the children of `parent`.
    pub fn schedule_reorder(
        &mut self,
        _ctx: &UowContext<'_>,
        parent: DocumentHandle,
        name: impl Into<String>,
        target: impl Into<String>,
        before: bool,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let state = self.state_of(parent)?;
        if state == DocumentState::Detached {
            return Err(OdmError::DetachedDocument(parent));
        }
        if state == DocumentState::Removed {
            self.removals.retain(|h| *h != parent);
            self.registry.set_state(parent, DocumentState::Managed);
        }
        self.reorders.push(ScheduledReorder {
            parent,
            name: name.into(),
            target: target.into(),
            before,
        });
        Ok(())
    }

    // =================================================================
    // Change-set computation
    // =================================================================

    fn compute_change_set(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<()> {
        if !self.computed.insert(handle) {
            return Ok(());
        }
        if self.registry.state(handle) != Some(DocumentState::Managed) {
            return Ok(());
        }
        let mapping = self.mapping_of(ctx, handle)?;

        // Children must not be flushed before a dirty parent.
        if let Some(parent) = self.document_of(handle)?.parent {
            if self.registry.state(parent) == Some(DocumentState::Managed) {
                self.compute_change_set(ctx, parent)?;
            }
        }

        if self.registry.snapshot(handle).is_none() {
            return self.observe_insert(ctx, handle, &mapping);
        }
        self.diff_against_snapshot(ctx, handle, &mapping)
    }

    /// A managed document without a snapshot is a pending insert: baseline
    /// it and pull its populated hierarchy and reachable references in.
    fn observe_insert(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        mapping: &ClassMapping,
    ) -> OdmResult<()> {
        let snapshot = self.snapshot_with_mapping(handle, mapping);
        self.registry.set_snapshot(handle, snapshot);
        if !self.insert_set.contains(&handle) {
            let mut visited = BTreeSet::new();
            self.schedule_insert_inner(ctx, handle, &mut visited)?;
        }

        let parent_id = self.document_of(handle)?.id.clone();
        for assoc in mapping.associations.clone() {
            match assoc.kind {
                AssociationKind::Child => {
                    let child = self.document_of(handle)?.singles.get(&assoc.name).copied();
                    if let Some(child) = child {
                        if self.state_of(child)? == DocumentState::New {
                            self.adopt_child(handle, child, &parent_id, &assoc.name)?;
                            let mut visited = BTreeSet::new();
                            self.schedule_insert_inner(ctx, child, &mut visited)?;
                        }
                        self.compute_change_set(ctx, child)?;
                    }
                }
                AssociationKind::Children => {
                    let entries: Vec<(String, DocumentHandle)> = self
                        .document_of(handle)?
                        .children
                        .get(&assoc.name)
                        .filter(|c| c.is_initialized())
                        .map(|c| c.iter().map(|(k, v)| (k.clone(), v)).collect())
                        .unwrap_or_default();
                    for (name, child) in entries {
                        if self.state_of(child)? == DocumentState::New {
                            self.adopt_child(handle, child, &parent_id, &name)?;
                            let mut visited = BTreeSet::new();
                            self.schedule_insert_inner(ctx, child, &mut visited)?;
                        }
                        self.compute_change_set(ctx, child)?;
                    }
                }
                AssociationKind::ReferenceOne
                | AssociationKind::ReferenceMany
                | AssociationKind::Referrers => {
                    self.guard_reachable_new(ctx, handle, &assoc.name, assoc.kind, assoc.cascade.persist)?;
                }
                AssociationKind::Parent => {}
            }
        }
        Ok(())
    }

    /// Reachability guard: a NEW document behind an association either
    /// cascades persist or fails the flush.
    fn guard_reachable_new(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc_name: &str,
        kind: AssociationKind,
        cascades: bool,
    ) -> OdmResult<()> {
        for target in self.association_targets(handle, assoc_name, kind) {
            if self.state_of(target)? != DocumentState::New {
                continue;
            }
            if !cascades {
                return Err(OdmError::CascadePersistRequired {
                    association: assoc_name.to_string(),
                });
            }
            let mut visited = BTreeSet::new();
            self.schedule_insert_inner(ctx, target, &mut visited)?;
            self.compute_change_set(ctx, target)?;
        }
        Ok(())
    }

    fn diff_against_snapshot(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        mapping: &ClassMapping,
    ) -> OdmResult<()> {
        let snapshot = self
            .registry
            .snapshot(handle)
            .cloned()
            .expect("checked by caller");
        let id = self
            .document_of(handle)?
            .id
            .clone()
            .ok_or_else(|| OdmError::MissingIdentifier("managed document without id".into()))?;

        // Identifiers are immutable outside an explicit move.
        if let Some(original_id) = &snapshot.id {
            if *original_id != id {
                return Err(OdmError::ImmutableIdentifier {
                    current: original_id.clone(),
                    attempted: id,
                });
            }
        }

        // Single-child associations: a different instance in the slot is
        // an assignment-based move, which is illegal.
        for assoc in mapping.associations_of(AssociationKind::Child) {
            let live = self.document_of(handle)?.singles.get(&assoc.name).copied();
            let original = snapshot.singles.get(&assoc.name).copied();
            match (original, live) {
                (Some(old), Some(new)) if old != new => {
                    return Err(OdmError::IllegalChildReassignment {
                        parent: id.clone(),
                        association: assoc.name.clone(),
                    });
                }
                (None, Some(new)) => {
                    if self.state_of(new)? == DocumentState::New {
                        let parent_id = Some(id.clone());
                        self.adopt_child(handle, new, &parent_id, &assoc.name)?;
                        let mut visited = BTreeSet::new();
                        self.schedule_insert_inner(ctx, new, &mut visited)?;
                        self.compute_change_set(ctx, new)?;
                    }
                }
                _ => {}
            }
        }

        // Reachability guard over references and referrers.
        for assoc in mapping.associations.clone() {
            if matches!(
                assoc.kind,
                AssociationKind::ReferenceOne
                    | AssociationKind::ReferenceMany
                    | AssociationKind::Referrers
            ) {
                self.guard_reachable_new(ctx, handle, &assoc.name, assoc.kind, assoc.cascade.persist)?;
            }
        }

        // Children collections: membership and order.
        let mut changeset = ChangeSet::default();
        for assoc in mapping.associations_of(AssociationKind::Children) {
            let Some((live_keys, original_keys, live_map)) = ({
                let document = self.document_of(handle)?;
                document.children.get(&assoc.name).and_then(|collection| {
                    if !collection.is_initialized() {
                        return None;
                    }
                    let live: Vec<String> = collection.keys();
                    let map: IndexMap<String, DocumentHandle> =
                        collection.iter().map(|(k, v)| (k.clone(), v)).collect();
                    let original = collection.original_names().map(|names| names.to_vec());
                    Some((live, original, map))
                })
            }) else {
                continue;
            };

            let original_keys = original_keys.unwrap_or_default();

            // Insertions.
            for key in &live_keys {
                if original_keys.contains(key) {
                    continue;
                }
                let child = live_map[key.as_str()];
                if self.state_of(child)? == DocumentState::New {
                    let parent_id = Some(id.clone());
                    self.adopt_child(handle, child, &parent_id, key)?;
                    let mut visited = BTreeSet::new();
                    self.schedule_insert_inner(ctx, child, &mut visited)?;
                    self.compute_change_set(ctx, child)?;
                }
            }

            // Removals: drop children whose keys vanished. Children never
            // loaded are removed by path.
            for key in &original_keys {
                if live_keys.contains(key) {
                    continue;
                }
                let child_path = id.join(key)?;
                match self.registry.lookup(&child_path) {
                    Some(child) => {
                        let mut visited = BTreeSet::new();
                        self.schedule_remove_inner(ctx, child, &mut visited)?;
                    }
                    None => self.orphan_removals.push(child_path),
                }
            }

            // Reordering among surviving keys.
            changeset
                .reorderings
                .extend(insert_before_pairs(&original_keys, &live_keys));
        }

        // Field diff. An in-flight locale switch keeps translated fields
        // even when value-equal, so they are rewritten under the new
        // locale.
        let current = self.flatten(handle, mapping);
        let locale_switch = {
            let document = self.document_of(handle)?;
            mapping.has_translated_fields()
                && document.locale.as_deref() != self.registry.locale(handle)
        };
        let translated: BTreeSet<&str> = mapping
            .fields
            .iter()
            .filter(|f| f.translated)
            .map(|f| f.property.as_str())
            .collect();
        for (property, value) in &current {
            let unchanged = snapshot.fields.get(property) == Some(value);
            if unchanged && !(locale_switch && translated.contains(property.as_str())) {
                continue;
            }
            changeset
                .fields
                .insert(property.clone(), Some(value.clone()));
        }
        for property in snapshot.fields.keys() {
            if !current.contains_key(property) {
                changeset.fields.insert(property.clone(), None);
            }
        }

        // Dirty multi-reference collections are retained even when
        // value-equal: their persistence is append/remove based.
        for assoc in mapping.associations_of(AssociationKind::ReferenceMany) {
            let dirty = self
                .document_of(handle)?
                .many_references
                .get(&assoc.name)
                .map(|c| c.is_dirty())
                .unwrap_or(false);
            if dirty {
                if let Some(property) = assoc.property.clone() {
                    if let Some(value) = current.get(&property) {
                        changeset
                            .fields
                            .entry(property)
                            .or_insert_with(|| Some(value.clone()));
                    }
                }
            }
        }

        // Implicit move: a changed parent or node name is an assignment-
        // based relocation, synthesized into the move queue.
        self.detect_implicit_move(handle, mapping, &snapshot, &id)?;

        if !changeset.is_empty() {
            self.changesets.insert(handle, changeset);
            self.updates.insert(handle);
            debug!(handle = %handle, "update scheduled");
        }
        Ok(())
    }

    fn detect_implicit_move(
        &mut self,
        handle: DocumentHandle,
        mapping: &ClassMapping,
        snapshot: &OriginalData,
        id: &NodePath,
    ) -> OdmResult<()> {
        let document = self.document_of(handle)?;
        let live_name = mapping
            .nodename_field
            .as_ref()
            .and_then(|f| document.fields.get(f))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| document.node_name.clone())
            .unwrap_or_else(|| id.name().to_string());
        let live_parent = document.parent;

        let name_changed = snapshot
            .node_name
            .as_deref()
            .map(|n| n != live_name)
            .unwrap_or(false);
        let parent_changed = live_parent != snapshot.parent && live_parent.is_some();
        if !name_changed && !parent_changed {
            return Ok(());
        }

        let parent_path = match live_parent {
            Some(parent) => self
                .registry
                .document(parent)
                .and_then(|d| d.id.clone())
                .ok_or_else(|| OdmError::MissingIdentifier("parent has no identifier yet".into()))?,
            None => id
                .parent()
                .ok_or_else(|| OdmError::InvalidArgument("cannot move the root document".into()))?,
        };
        let target = parent_path.join(&live_name)?;
        if target != *id && !self.move_targets.contains_key(&handle) {
            debug!(handle = %handle, target = %target, "implicit move detected");
            self.move_targets.insert(handle, target);
        }
        Ok(())
    }

    // =================================================================
    // Commit
    // =================================================================

    /// Flush scheduled work to the store. With `restrict`, change sets are
    /// computed only for the given documents (plus everything reachable
    /// through the insert queue); otherwise for every managed document.
    pub fn commit(
        &mut self,
        ctx: &UowContext<'_>,
        restrict: Option<&[DocumentHandle]>,
    ) -> OdmResult<()> {
        self.assert_open()?;
        ctx.events.dispatch(LifecycleEvent::PreFlush, None);

        self.computed.clear();
        let initial: Vec<DocumentHandle> = match restrict {
            Some(handles) => handles.to_vec(),
            None => self.registry.managed_handles(),
        };
        for handle in initial {
            self.compute_change_set(ctx, handle)?;
        }
        // Reachability may have scheduled further inserts; drain until
        // the queue stops growing.
        loop {
            let pending: Vec<DocumentHandle> = self
                .inserts
                .iter()
                .filter(|h| !self.computed.contains(h))
                .copied()
                .collect();
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                self.compute_change_set(ctx, handle)?;
            }
        }

        ctx.events.dispatch(LifecycleEvent::OnFlush, None);

        let transactional = ctx.session.supports_transactions();
        if transactional {
            ctx.session.begin_transaction()?;
        }

        let result = self
            .execute_phases(ctx)
            .and_then(|_| ctx.session.save().map_err(OdmError::from))
            .and_then(|_| {
                if transactional {
                    ctx.session.commit_transaction().map_err(OdmError::from)
                } else {
                    Ok(())
                }
            });

        if let Err(error) = result {
            warn!(error = %error, "commit failed; unit of work is closed");
            self.closed = true;
            if transactional {
                if let Err(rollback) = ctx.session.rollback_transaction() {
                    warn!(error = %rollback, "rollback after failed commit also failed");
                }
            }
            return Err(error);
        }

        self.rebase_snapshots(ctx)?;
        ctx.events.dispatch(LifecycleEvent::PostFlush, None);
        self.clear_transient();
        Ok(())
    }

    fn execute_phases(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let mut deferred = Vec::new();
        self.execute_inserts(ctx, &mut deferred)?;
        self.execute_updates(ctx)?;
        self.execute_deferred_references(ctx, deferred)?;
        self.execute_removals(ctx)?;
        self.execute_reorders(ctx)?;
        self.execute_moves(ctx)?;
        Ok(())
    }

    fn execute_inserts(
        &mut self,
        ctx: &UowContext<'_>,
        deferred: &mut Vec<DeferredReferenceWrite>,
    ) -> OdmResult<()> {
        // Parents precede children: order by path depth, scheduling order
        // breaking ties.
        let mut ordered: Vec<(usize, usize, DocumentHandle)> = Vec::new();
        for (seq, handle) in self.inserts.iter().enumerate() {
            let Some(document) = self.registry.document(*handle) else {
                continue;
            };
            let Some(id) = &document.id else { continue };
            ordered.push((id.depth(), seq, *handle));
        }
        ordered.sort();
        info!(count = ordered.len(), "executing inserts");

        for (_, _, handle) in ordered {
            if self.registry.state(handle) != Some(DocumentState::Managed) {
                continue;
            }
            let mapping = self.mapping_of(ctx, handle)?;
            let id = self
                .document_of(handle)?
                .id
                .clone()
                .expect("scheduled inserts carry ids");
            let parent = id
                .parent()
                .ok_or_else(|| OdmError::InvalidArgument("cannot insert the root".into()))?;

            ctx.session.create_node(&parent, id.name(), &mapping.node_type)?;
            ctx.session.add_mixin(&id, MANAGED_MIXIN)?;
            ctx.session.set_property(
                &id,
                CLASS_PROPERTY,
                PropertyValue::from(self.document_of(handle)?.tag.as_str()),
            )?;
            if mapping.is_versioned() {
                ctx.session.add_mixin(&id, VERSIONABLE_MIXIN)?;
            }

            let reference_properties: BTreeSet<&str> = mapping
                .associations
                .iter()
                .filter(|a| a.kind.is_reference())
                .filter_map(|a| a.property.as_deref())
                .collect();
            let translated: BTreeSet<&str> = mapping
                .fields
                .iter()
                .filter(|f| f.translated)
                .map(|f| f.property.as_str())
                .collect();

            let flat = self.flatten(handle, &mapping);
            let mut translated_values = BTreeMap::new();
            for (property, value) in flat {
                if translated.contains(property.as_str()) {
                    translated_values.insert(property, value);
                } else if reference_properties.contains(property.as_str()) {
                    // The referenced node may be created later in this
                    // same flush; write after all inserts.
                    deferred.push(DeferredReferenceWrite {
                        path: id.clone(),
                        property,
                        value,
                    });
                } else {
                    ctx.session.set_property(&id, &property, value)?;
                }
            }
            if !translated_values.is_empty() {
                self.save_translations(ctx, handle, &mapping, &id, &translated_values)?;
            }
            ctx.events.dispatch(LifecycleEvent::PostPersist, Some(handle));
        }
        Ok(())
    }

    fn execute_updates(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let handles: Vec<DocumentHandle> = self.updates.iter().copied().collect();
        for handle in handles {
            if self.registry.state(handle) != Some(DocumentState::Managed) {
                continue;
            }
            if self.insert_set.contains(&handle) {
                // The insert already wrote current values.
                continue;
            }
            let Some(changeset) = self.changesets.get(&handle).cloned() else {
                continue;
            };
            let mapping = self.mapping_of(ctx, handle)?;
            let id = self
                .document_of(handle)?
                .id
                .clone()
                .ok_or_else(|| OdmError::MissingIdentifier("managed document without id".into()))?;
            ctx.events.dispatch(LifecycleEvent::PreUpdate, Some(handle));

            let translated: BTreeSet<&str> = mapping
                .fields
                .iter()
                .filter(|f| f.translated)
                .map(|f| f.property.as_str())
                .collect();
            let mut translated_values = BTreeMap::new();
            for (property, change) in &changeset.fields {
                if translated.contains(property.as_str()) {
                    if let Some(value) = change {
                        translated_values.insert(property.clone(), value.clone());
                    }
                    continue;
                }
                match change {
                    Some(value) => ctx.session.set_property(&id, property, value.clone())?,
                    None => {
                        ctx.session.remove_property(&id, property)?;
                    }
                }
            }
            if !translated_values.is_empty() {
                self.save_translations(ctx, handle, &mapping, &id, &translated_values)?;
            }
            for pair in &changeset.reorderings {
                ctx.session.order_before(&id, &pair.key, Some(&pair.before))?;
            }
            ctx.events.dispatch(LifecycleEvent::PostUpdate, Some(handle));
        }
        Ok(())
    }

    fn execute_deferred_references(
        &mut self,
        ctx: &UowContext<'_>,
        deferred: Vec<DeferredReferenceWrite>,
    ) -> OdmResult<()> {
        for write in deferred {
            ctx.session
                .set_property(&write.path, &write.property, write.value)?;
        }
        Ok(())
    }

    fn execute_removals(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let handles: Vec<DocumentHandle> = self.removals.clone();
        for handle in handles {
            if self.registry.state(handle) != Some(DocumentState::Removed) {
                continue;
            }
            let id = self.registry.document(handle).and_then(|d| d.id.clone());
            if let Some(id) = id {
                let mapping = self.mapping_of(ctx, handle)?;
                if mapping.has_translated_fields() && mapping.translator.is_some() {
                    let strategy = self.strategy_for(ctx, &mapping)?;
                    strategy.remove_all_translations(ctx.session, &id, &mapping)?;
                }
                // Unregister loaded descendants so later writes cannot
                // resurrect orphaned nodes.
                for descendant in self.registry.descendants_of(&id) {
                    self.registry.purge(descendant);
                }
                ctx.session.remove_node(&id)?;
                debug!(id = %id, "document removed");
            }
            ctx.events.dispatch(LifecycleEvent::PostRemove, Some(handle));
            self.registry.purge(handle);
        }

        let orphans = std::mem::take(&mut self.orphan_removals);
        for path in orphans {
            for descendant in self.registry.descendants_of(&path) {
                self.registry.purge(descendant);
            }
            if let Some(handle) = self.registry.lookup(&path) {
                self.registry.purge(handle);
            }
            ctx.session.remove_node(&path)?;
        }
        Ok(())
    }

    fn execute_reorders(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let reorders = std::mem::take(&mut self.reorders);
        for reorder in &reorders {
            if self.registry.state(reorder.parent) != Some(DocumentState::Managed) {
                continue;
            }
            let Some(id) = self
                .registry
                .document(reorder.parent)
                .and_then(|d| d.id.clone())
            else {
                continue;
            };
            let before: Option<String> = if reorder.before {
                Some(reorder.target.clone())
            } else {
                // Ordering after a sibling: scan forward from it for the
                // effective insert-before target.
                let children = ctx.session.child_names(&id, None)?;
                match children.iter().position(|c| *c == reorder.target) {
                    Some(index) => children
                        .iter()
                        .skip(index + 1)
                        .find(|c| **c != reorder.name)
                        .cloned(),
                    None => {
                        return Err(OdmError::Store(StoreError::NoSuchChild {
                            parent: id,
                            name: reorder.target.clone(),
                        }))
                    }
                }
            };
            ctx.session.order_before(&id, &reorder.name, before.as_deref())?;

            // Loaded children collections of this parent now hold a stale
            // order; re-fetch on next access.
            if let Some(document) = self.registry.document_mut(reorder.parent) {
                for collection in document.children.values_mut() {
                    collection.invalidate();
                }
            }
        }
        Ok(())
    }

    fn execute_moves(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let moves: Vec<(DocumentHandle, NodePath)> = self
            .move_targets
            .iter()
            .map(|(h, t)| (*h, t.clone()))
            .collect();
        for (handle, target) in moves {
            if self.registry.state(handle) != Some(DocumentState::Managed) {
                continue;
            }
            let Some(src) = self.registry.document(handle).and_then(|d| d.id.clone()) else {
                continue;
            };
            if src == target {
                continue;
            }
            ctx.session.move_node(&src, &target)?;
            info!(src = %src, dst = %target, "document moved");

            // Rewrite the identity map for the whole loaded subtree.
            let descendants = self.registry.descendants_of(&src);
            self.registry.rebind_id(handle, target.clone())?;
            for descendant in descendants {
                let old = self
                    .registry
                    .document(descendant)
                    .and_then(|d| d.id.clone())
                    .expect("descendants are identified");
                let new = old
                    .reparent(&src, &target)
                    .expect("descendant ids lie under the moved path");
                self.registry.rebind_id(descendant, new)?;
            }

            // Re-derive hierarchy fields from the post-move location.
            let mapping = self.mapping_of(ctx, handle)?;
            let new_parent = target.parent().and_then(|p| self.registry.lookup(&p));
            if let Some(document) = self.registry.document_mut(handle) {
                document.parent = new_parent;
                if let Some(field) = &mapping.nodename_field {
                    document
                        .fields
                        .insert(field.clone(), PropertyValue::from(target.name()));
                }
            }
            ctx.events.dispatch(LifecycleEvent::PostMove, Some(handle));
        }
        Ok(())
    }

    fn save_translations(
        &self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        mapping: &ClassMapping,
        id: &NodePath,
        values: &BTreeMap<String, PropertyValue>,
    ) -> OdmResult<()> {
        let strategy = self.strategy_for(ctx, mapping)?;
        let locale = self.effective_locale(ctx, handle)?;
        strategy.save_translation(ctx.session, id, mapping, values, &locale)?;
        Ok(())
    }

    fn strategy_for<'c>(
        &self,
        ctx: &UowContext<'c>,
        mapping: &ClassMapping,
    ) -> OdmResult<&'c dyn TranslationStrategy> {
        let key = mapping
            .translator
            .as_deref()
            .ok_or_else(|| OdmError::UnknownTranslationStrategy("<unset>".into()))?;
        ctx.translations
            .get(key)
            .map(|s| s.as_ref())
            .ok_or_else(|| OdmError::UnknownTranslationStrategy(key.to_string()))
    }

    fn effective_locale(&self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<String> {
        if let Some(locale) = self
            .registry
            .document(handle)
            .and_then(|d| d.locale.clone())
        {
            return Ok(locale);
        }
        ctx.locale_chooser
            .map(|c| c.default_locale().to_string())
            .ok_or(OdmError::MissingLocaleChooser)
    }

    /// Post-commit bookkeeping: rebase snapshots of the documents that
    /// took part in this flush, mark their collections clean, and record
    /// flushed locales. Documents outside a restricted flush keep their
    /// old baseline so their pending changes survive.
    fn rebase_snapshots(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        let flushed: Vec<DocumentHandle> = self
            .computed
            .iter()
            .copied()
            .filter(|h| self.registry.state(*h) == Some(DocumentState::Managed))
            .collect();
        for handle in flushed {
            let mapping = self.mapping_of(ctx, handle)?;

            // Resolve live reference paths before taking &mut borrows.
            let document = self.document_of(handle)?;
            let many_paths: Vec<(String, Option<Vec<NodePath>>)> = document
                .many_references
                .iter()
                .map(|(name, collection)| {
                    let paths = collection.is_initialized().then(|| {
                        collection
                            .handles()
                            .iter()
                            .filter_map(|h| self.registry.document(*h).and_then(|d| d.id.clone()))
                            .collect()
                    });
                    (name.clone(), paths)
                })
                .collect();
            let referrer_paths: Vec<(String, Option<Vec<NodePath>>)> = document
                .referrers
                .iter()
                .map(|(name, collection)| {
                    let paths = collection.is_initialized().then(|| {
                        collection
                            .handles()
                            .iter()
                            .filter_map(|h| self.registry.document(*h).and_then(|d| d.id.clone()))
                            .collect()
                    });
                    (name.clone(), paths)
                })
                .collect();
            let flushed_locale = if mapping.has_translated_fields() {
                self.effective_locale(ctx, handle).ok()
            } else {
                None
            };

            let snapshot = self.snapshot_with_mapping(handle, &mapping);
            if let Some(document) = self.registry.document_mut(handle) {
                for collection in document.children.values_mut() {
                    collection.take_snapshot();
                }
                for (name, paths) in many_paths {
                    if let Some(collection) = document.many_references.get_mut(&name) {
                        collection.take_snapshot(paths);
                    }
                }
                for (name, paths) in referrer_paths {
                    if let Some(collection) = document.referrers.get_mut(&name) {
                        collection.take_snapshot(paths);
                    }
                }
            }
            self.registry.set_snapshot(handle, snapshot);
            if let Some(locale) = flushed_locale {
                self.registry.set_locale(handle, locale);
            }
        }
        Ok(())
    }

    fn clear_transient(&mut self) {
        self.inserts.clear();
        self.insert_set.clear();
        self.updates.clear();
        self.removals.clear();
        self.orphan_removals.clear();
        self.move_targets.clear();
        self.reorders.clear();
        self.changesets.clear();
        self.computed.clear();
    }

    // =================================================================
    // Detach / refresh / merge / clear
    // =================================================================

    /// Remove a document from tracking, cascading per association flags.
    pub fn detach(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<()> {
        self.assert_open()?;
        let mut visited = BTreeSet::new();
        self.detach_inner(ctx, handle, &mut visited)
    }

    fn detach_inner(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        if self.registry.state(handle).is_none() {
            return Err(OdmError::UnknownHandle(handle));
        }
        let mapping = self.mapping_of(ctx, handle)?;
        let mut cascade_targets = Vec::new();
        for assoc in &mapping.associations {
            if assoc.cascade.detach {
                cascade_targets.extend(self.association_targets(handle, &assoc.name, assoc.kind));
            }
        }

        self.registry.detach(handle);
        self.inserts.retain(|h| *h != handle);
        self.insert_set.remove(&handle);
        self.updates.remove(&handle);
        self.removals.retain(|h| *h != handle);
        self.move_targets.remove(&handle);
        self.reorders.retain(|r| r.parent != handle);
        self.changesets.remove(&handle);

        for target in cascade_targets {
            self.detach_inner(ctx, target, visited)?;
        }
        Ok(())
    }

    /// Re-read a managed document from the store, discarding in-memory
    /// changes, cascading per association flags.
    pub fn refresh(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<()> {
        self.assert_open()?;
        let mut visited = BTreeSet::new();
        self.refresh_inner(ctx, handle, &mut visited)
    }

    fn refresh_inner(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        if self.registry.state(handle) != Some(DocumentState::Managed) {
            return Err(OdmError::NotManaged(handle));
        }
        let id = self
            .document_of(handle)?
            .id
            .clone()
            .ok_or_else(|| OdmError::MissingIdentifier("managed document without id".into()))?;
        let node = ctx
            .session
            .node(&id)?
            .ok_or(OdmError::Store(StoreError::NotFound(id)))?;

        let mapping = self.mapping_of(ctx, handle)?;
        let mut cascade_targets = Vec::new();
        for assoc in &mapping.associations {
            if assoc.cascade.refresh {
                cascade_targets.extend(self.association_targets(handle, &assoc.name, assoc.kind));
            }
        }

        let tag = self.document_of(handle)?.tag.clone();
        let fresh = self.document_from_node(&node, tag, &mapping);
        if let Some(document) = self.registry.document_mut(handle) {
            let id = document.id.clone();
            *document = fresh;
            document.id = id;
        }
        let snapshot = self.snapshot_with_mapping(handle, &mapping);
        self.registry.set_snapshot(handle, snapshot);
        self.changesets.remove(&handle);
        ctx.events.dispatch(LifecycleEvent::PostLoad, Some(handle));

        for target in cascade_targets {
            if self.registry.state(target) == Some(DocumentState::Managed) {
                self.refresh_inner(ctx, target, visited)?;
            }
        }
        Ok(())
    }

    /// Fold the state of a detached (or new-with-identity) document into
    /// the managed instance for its id, returning the managed handle.
    pub fn merge(&mut self, ctx: &UowContext<'_>, handle: DocumentHandle) -> OdmResult<DocumentHandle> {
        self.assert_open()?;
        let mut visited = BTreeSet::new();
        self.merge_inner(ctx, handle, &mut visited)
    }

    fn merge_inner(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        visited: &mut BTreeSet<DocumentHandle>,
    ) -> OdmResult<DocumentHandle> {
        if !visited.insert(handle) {
            return Ok(handle);
        }
        let state = self.state_of(handle)?;
        if state == DocumentState::Managed {
            return Ok(handle);
        }
        let id = self
            .document_of(handle)?
            .id
            .clone()
            .ok_or_else(|| {
                OdmError::InvalidArgument("cannot merge a document without identity".into())
            })?;
        let managed = self.find(ctx, &id)?.ok_or_else(|| {
            OdmError::InvalidArgument(format!("cannot merge: no persisted document at {id}"))
        })?;

        let (fields, locale) = {
            let detached = self.document_of(handle)?;
            (detached.fields.clone(), detached.locale.clone())
        };
        let mapping = self.mapping_of(ctx, handle)?;
        let mut cascade_targets = Vec::new();
        for assoc in &mapping.associations {
            if assoc.cascade.merge {
                cascade_targets.extend(self.association_targets(handle, &assoc.name, assoc.kind));
            }
        }

        if let Some(document) = self.registry.document_mut(managed) {
            document.fields = fields;
            document.locale = locale;
        }
        for target in cascade_targets {
            self.merge_inner(ctx, target, visited)?;
        }
        Ok(managed)
    }

    /// Forget every tracked document and all pending work.
    pub fn clear(&mut self, ctx: &UowContext<'_>) -> OdmResult<()> {
        self.assert_open()?;
        ctx.events.dispatch(LifecycleEvent::OnClear, None);
        self.registry.clear();
        self.clear_transient();
        info!("unit of work cleared");
        Ok(())
    }

    // =================================================================
    // Lazy association access
    // =================================================================

    /// Materialize a children collection from the store, loading each
    /// child through the identity map.
    pub fn ensure_children_loaded(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let id = self.identified(handle)?;
        let (proceed, filter) = {
            let document = self
                .registry
                .document_mut(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document.children.get_mut(assoc).ok_or_else(|| {
                OdmError::InvalidArgument(format!("no children association {assoc:?}"))
            })?;
            (
                collection.begin_initialize(),
                collection.filter().map(str::to_string),
            )
        };
        if !proceed {
            return Ok(());
        }
        let names = ctx.session.child_names(&id, filter.as_deref())?;
        let mut items = IndexMap::new();
        for name in names {
            let child_path = id.join(&name)?;
            if let Some(child) = self.find(ctx, &child_path)? {
                items.insert(name, child);
            }
        }
        if let Some(document) = self.registry.document_mut(handle) {
            if let Some(collection) = document.children.get_mut(assoc) {
                collection.complete_initialize(items);
            }
        }
        Ok(())
    }

    /// Fetch (once) the cheap child-name listing backing count/membership
    /// hints on an uninitialized children collection.
    pub fn ensure_child_names(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let id = self.identified(handle)?;
        let needs_fetch = {
            let document = self.document_of(handle)?;
            let collection = document.children.get(assoc).ok_or_else(|| {
                OdmError::InvalidArgument(format!("no children association {assoc:?}"))
            })?;
            !collection.is_initialized() && collection.original_names().is_none()
        };
        if !needs_fetch {
            return Ok(());
        }
        let filter = self
            .document_of(handle)?
            .children
            .get(assoc)
            .and_then(|c| c.filter().map(str::to_string));
        let names = ctx.session.child_names(&id, filter.as_deref())?;
        if let Some(document) = self.registry.document_mut(handle) {
            if let Some(collection) = document.children.get_mut(assoc) {
                collection.set_original_names(names);
            }
        }
        Ok(())
    }

    /// Materialize a multi-reference collection.
    pub fn ensure_references_loaded(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let (proceed, paths) = {
            let document = self
                .registry
                .document_mut(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document.many_references.get_mut(assoc).ok_or_else(|| {
                OdmError::InvalidArgument(format!("no reference association {assoc:?}"))
            })?;
            (
                collection.begin_initialize(),
                collection.referenced_paths().to_vec(),
            )
        };
        if !proceed {
            return Ok(());
        }
        let mut handles = Vec::new();
        for path in paths {
            if let Some(target) = self.find(ctx, &path)? {
                handles.push(target);
            }
        }
        if let Some(document) = self.registry.document_mut(handle) {
            if let Some(collection) = document.many_references.get_mut(assoc) {
                collection.complete_initialize(handles);
            }
        }
        Ok(())
    }

    /// Materialize a referrers collection via the store's reverse lookup.
    pub fn ensure_referrers_loaded(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<()> {
        self.assert_open()?;
        let id = self.identified(handle)?;
        let (proceed, filter) = {
            let document = self
                .registry
                .document_mut(handle)
                .ok_or(OdmError::UnknownHandle(handle))?;
            let collection = document.referrers.get_mut(assoc).ok_or_else(|| {
                OdmError::InvalidArgument(format!("no referrers association {assoc:?}"))
            })?;
            (
                collection.begin_initialize(),
                collection.property_filter().map(str::to_string),
            )
        };
        if !proceed {
            return Ok(());
        }
        let paths = ctx.session.referrers(&id, filter.as_deref())?;
        let mut handles = Vec::new();
        for path in &paths {
            if let Some(target) = self.find(ctx, path)? {
                handles.push(target);
            }
        }
        if let Some(document) = self.registry.document_mut(handle) {
            if let Some(collection) = document.referrers.get_mut(assoc) {
                collection.complete_initialize(handles, paths);
            }
        }
        Ok(())
    }

    /// Materialize a lazy single-child association slot.
    pub fn ensure_child_loaded(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Option<DocumentHandle>> {
        self.assert_open()?;
        if let Some(child) = self.document_of(handle)?.singles.get(assoc) {
            return Ok(Some(*child));
        }
        let id = self.identified(handle)?;
        let child_path = id.join(assoc)?;
        let Some(child) = self.find(ctx, &child_path)? else {
            return Ok(None);
        };
        if let Some(document) = self.registry.document_mut(handle) {
            document.singles.insert(assoc.to_string(), child);
        }
        // Keep the baseline consistent: a lazily materialized child is
        // original state, not a new assignment.
        if let Some(snapshot) = self.registry.snapshot(handle).cloned().map(|mut s| {
            s.singles.insert(assoc.to_string(), child);
            s
        }) {
            self.registry.set_snapshot(handle, snapshot);
        }
        Ok(Some(child))
    }

    /// Force a lazy single-reference slot to its loaded form.
    pub fn ensure_reference_loaded(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        assoc: &str,
    ) -> OdmResult<Option<DocumentHandle>> {
        self.assert_open()?;
        let reference = self.document_of(handle)?.references.get(assoc).cloned();
        match reference {
            None => Ok(None),
            Some(Reference::Loaded(target)) => Ok(Some(target)),
            Some(Reference::Lazy(path)) => {
                let Some(target) = self.find(ctx, &path)? else {
                    return Ok(None);
                };
                if let Some(document) = self.registry.document_mut(handle) {
                    document
                        .references
                        .insert(assoc.to_string(), Reference::Loaded(target));
                }
                Ok(Some(target))
            }
        }
    }

    fn identified(&self, handle: DocumentHandle) -> OdmResult<NodePath> {
        self.document_of(handle)?
            .id
            .clone()
            .ok_or(OdmError::NotManaged(handle))
    }

    // =================================================================
    // Translation binding
    // =================================================================

    /// Load a persisted translation in place and bind the locale. Returns
    /// `false` when no translation exists for the locale (the binding
    /// still applies, so a subsequent flush writes under it).
    pub fn bind_translation(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
        locale: &str,
    ) -> OdmResult<bool> {
        self.assert_open()?;
        if self.registry.state(handle) != Some(DocumentState::Managed) {
            return Err(OdmError::NotManaged(handle));
        }
        let id = self.identified(handle)?;
        let mapping = self.mapping_of(ctx, handle)?;
        let strategy = self.strategy_for(ctx, &mapping)?;

        let chain = match ctx.locale_chooser {
            Some(chooser) => chooser.fallback(locale),
            None => vec![locale.to_string()],
        };
        let mut loaded = None;
        for candidate in &chain {
            if let Some(fields) = strategy.load_translation(ctx.session, &id, &mapping, candidate)? {
                loaded = Some(fields);
                break;
            }
        }

        let found = loaded.is_some();
        if let Some(values) = loaded {
            let mut snapshot = self.registry.snapshot(handle).cloned().unwrap_or_default();
            for (property, value) in values {
                if let Some(field) = mapping.fields.iter().find(|f| f.property == property) {
                    if let Some(document) = self.registry.document_mut(handle) {
                        document.fields.insert(field.name.clone(), value.clone());
                    }
                }
                snapshot.fields.insert(property, value);
            }
            self.registry.set_snapshot(handle, snapshot);
        }
        if let Some(document) = self.registry.document_mut(handle) {
            document.locale = Some(locale.to_string());
        }
        self.registry.set_locale(handle, locale);
        Ok(found)
    }

    /// Locales with a persisted translation for this document.
    pub fn locales_for(
        &mut self,
        ctx: &UowContext<'_>,
        handle: DocumentHandle,
    ) -> OdmResult<Vec<String>> {
        self.assert_open()?;
        let id = self.identified(handle)?;
        let mapping = self.mapping_of(ctx, handle)?;
        let strategy = self.strategy_for(ctx, &mapping)?;
        strategy.locales_for(ctx.session, &id, &mapping)
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("registry", &self.registry)
            .field("inserts", &self.inserts.len())
            .field("updates", &self.updates.len())
            .field("removals", &self.removals.len())
            .field("moves", &self.move_targets.len())
            .field("reorders", &self.reorders.len())
            .field("closed", &self.closed)
            .finish()
    }
}
