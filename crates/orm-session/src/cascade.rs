//! Cascade engine: propagates a lifecycle operation from a parent across
//! its associations.

use crate::event::{CopyCache, ReplicationMode};
use crate::Session;
use crate::collection_entry::added_elements;
use orm_core::{
    CascadeKind, CollectionHandle, Element, EntityHandle, EntityPersister, ForeignKeyDirection,
    LockMode, PropertyKind, PropertyMetadata, PropertyValue, Result,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Moment in the parent's lifecycle at which a cascade runs. Decides which
/// association directions are walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// After the parent is inserted, before it is deleted: collections and
    /// one-to-one children.
    AfterInsertBeforeDelete,
    /// Before the parent is inserted, after it is deleted: many-to-one targets.
    BeforeInsertAfterDelete,
    /// Like [`CascadePoint::AfterInsertBeforeDelete`], reached through a collection.
    AfterInsertBeforeDeleteViaCollection,
    /// After a detached parent is reattached by update.
    AfterUpdate,
    /// Before a flush, from every managed instance.
    BeforeFlush,
    /// After the parent is evicted.
    AfterEvict,
    /// Before the parent is refreshed.
    BeforeRefresh,
    /// After the parent is locked.
    AfterLock,
    /// Before the parent's state is copied by merge.
    BeforeMerge,
}

impl CascadePoint {
    /// Does an association with `direction` cascade at this point?
    pub const fn cascades(self, direction: ForeignKeyDirection) -> bool {
        match self {
            CascadePoint::AfterInsertBeforeDelete
            | CascadePoint::AfterInsertBeforeDeleteViaCollection => {
                matches!(direction, ForeignKeyDirection::ToParent)
            }
            CascadePoint::BeforeInsertAfterDelete => {
                matches!(direction, ForeignKeyDirection::FromParent)
            }
            _ => true,
        }
    }
}

/// The operation being propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadingAction {
    SaveUpdate,
    Persist,
    Merge,
    Delete,
    Lock(LockMode),
    Refresh,
    Evict,
    Replicate(ReplicationMode),
}

impl CascadingAction {
    /// Cascade style bit consulted for this action.
    pub const fn kind(self) -> CascadeKind {
        match self {
            CascadingAction::SaveUpdate => CascadeKind::SaveUpdate,
            CascadingAction::Persist => CascadeKind::Persist,
            CascadingAction::Merge => CascadeKind::Merge,
            CascadingAction::Delete => CascadeKind::Delete,
            CascadingAction::Lock(_) => CascadeKind::Lock,
            CascadingAction::Refresh => CascadeKind::Refresh,
            CascadingAction::Evict => CascadeKind::Evict,
            CascadingAction::Replicate(_) => CascadeKind::Replicate,
        }
    }

    /// Does this action delete children dropped from orphan-removing associations?
    pub const fn deletes_orphans(self) -> bool {
        matches!(self, CascadingAction::SaveUpdate | CascadingAction::Delete)
    }

    /// Must lazy collections be loaded so every element is reached?
    pub const fn initializes_collections(self) -> bool {
        matches!(
            self,
            CascadingAction::Delete
                | CascadingAction::Persist
                | CascadingAction::Refresh
                | CascadingAction::Replicate(_)
        )
    }
}

/// State shared across one cascade walk.
#[derive(Debug, Default)]
pub struct CascadeContext {
    /// Original-to-copy map of a merge.
    pub copy_cache: CopyCache,
    /// Instances an action already handled, by object identity.
    pub(crate) visited: HashSet<usize>,
}

impl CascadeContext {
    /// Fresh context for one top-level operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context continuing a merge with an existing copy cache.
    pub fn with_copy_cache(copy_cache: CopyCache) -> Self {
        Self {
            copy_cache,
            visited: HashSet::new(),
        }
    }

    /// Record `entity` as handled; false when it already was.
    pub(crate) fn visit(&mut self, entity: &EntityHandle) -> bool {
        self.visited.insert(entity.object_id())
    }
}

// ============================================================================
// Walk
// ============================================================================

impl Session {
    /// Cascade `action` from `parent` across every association whose style
    /// includes it and whose direction applies at `point`.
    pub(crate) fn cascade(
        &mut self,
        action: CascadingAction,
        point: CascadePoint,
        persister: &Arc<dyn EntityPersister>,
        parent: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        if parent.is_uninitialized() {
            return Ok(());
        }
        let metadata = Arc::clone(persister.metadata());
        if !has_cascades(&metadata.properties) {
            return Ok(());
        }
        let state = persister.get_property_values(parent)?;
        let loaded = self
            .pc
            .get_entry(parent)
            .and_then(|e| e.loaded_state().map(<[PropertyValue]>::to_vec));
        tracing::trace!(
            entity = %metadata.name,
            action = ?action,
            point = ?point,
            level = self.pc.cascade_level(),
            "Cascading"
        );

        self.pc.increment_cascade_level();
        let result = self.cascade_properties(
            action,
            point,
            &metadata.properties,
            &state,
            loaded.as_deref(),
            ctx,
        );
        self.pc.decrement_cascade_level();
        result
    }

    fn cascade_properties(
        &mut self,
        action: CascadingAction,
        point: CascadePoint,
        properties: &[PropertyMetadata],
        state: &[PropertyValue],
        loaded: Option<&[PropertyValue]>,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        for (i, property) in properties.iter().enumerate() {
            let Some(value) = state.get(i) else {
                continue;
            };
            let loaded_value = loaded.and_then(|l| l.get(i));
            self.cascade_property(action, point, property, value, loaded_value, ctx)?;
        }
        Ok(())
    }

    fn cascade_property(
        &mut self,
        action: CascadingAction,
        point: CascadePoint,
        property: &PropertyMetadata,
        value: &PropertyValue,
        loaded_value: Option<&PropertyValue>,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        let style = property.cascade;
        let cascades = style.does_cascade(action.kind());
        let removes_orphans = style.has_orphan_delete() && action.deletes_orphans();

        match &property.kind {
            PropertyKind::Basic => Ok(()),
            PropertyKind::Component { properties } => {
                let Some(nested) = value.as_component() else {
                    return Ok(());
                };
                let nested_loaded = loaded_value.and_then(PropertyValue::as_component);
                self.cascade_properties(action, point, properties, nested, nested_loaded, ctx)
            }
            PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. } => {
                let direction = property
                    .kind
                    .foreign_key_direction()
                    .unwrap_or(ForeignKeyDirection::FromParent);
                if !point.cascades(direction) {
                    return Ok(());
                }
                if cascades {
                    if let Some(child) = value.as_entity() {
                        self.cascade_to_one(action, child, ctx)?;
                    }
                }
                let logical_one_to_one = matches!(property.kind, PropertyKind::OneToOne { .. });
                if removes_orphans && logical_one_to_one {
                    if let Some(previous) = loaded_value.and_then(PropertyValue::as_entity) {
                        let replaced = value
                            .as_entity()
                            .is_none_or(|current| !same_instance(current, previous));
                        if replaced {
                            self.delete_orphan(previous)?;
                        }
                    }
                }
                Ok(())
            }
            PropertyKind::Collection { .. } => {
                if !point.cascades(ForeignKeyDirection::ToParent) {
                    return Ok(());
                }
                let Some(collection) = value.as_collection() else {
                    return Ok(());
                };
                if cascades {
                    for element in self.cascadable_elements(action, collection)? {
                        if let Element::Entity(child) = element {
                            self.cascade_to_one(action, &child, ctx)?;
                        }
                    }
                }
                if removes_orphans {
                    self.delete_collection_orphans(collection)?;
                }
                Ok(())
            }
        }
    }

    /// Elements an action walks: all of them for actions that load lazy
    /// collections, otherwise only those already in memory.
    fn cascadable_elements(
        &mut self,
        action: CascadingAction,
        collection: &CollectionHandle,
    ) -> Result<Vec<Element>> {
        if collection.is_initialized() {
            return Ok(collection.loaded_elements());
        }
        if action.initializes_collections() && self.pc.get_collection_entry(collection).is_some() {
            self.initialize_collection(collection)?;
            return Ok(collection.loaded_elements());
        }
        Ok(Vec::new())
    }

    fn cascade_to_one(
        &mut self,
        action: CascadingAction,
        child: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        match action {
            CascadingAction::SaveUpdate => self.save_or_update_internal(child).map(drop),
            CascadingAction::Persist => self.persist_internal(child, ctx),
            CascadingAction::Merge => self.merge_internal(child, ctx).map(drop),
            CascadingAction::Delete => self.delete_internal(child, false, ctx),
            CascadingAction::Lock(mode) => self.lock_internal(child, mode),
            CascadingAction::Refresh => self.refresh_internal(child, LockMode::None, ctx),
            CascadingAction::Evict => self.evict_internal(child),
            CascadingAction::Replicate(mode) => self.replicate_internal(child, mode),
        }
    }

    /// Delete the entity elements present in the snapshot but gone from
    /// the collection.
    fn delete_collection_orphans(&mut self, collection: &CollectionHandle) -> Result<()> {
        if !collection.is_initialized() {
            return Ok(());
        }
        let Some(snapshot) = self
            .pc
            .get_collection_entry(collection)
            .and_then(|e| e.snapshot().map(<[Element]>::to_vec))
        else {
            return Ok(());
        };
        let orphans = added_elements(&collection.loaded_elements(), &snapshot);
        for orphan in orphans {
            if let Element::Entity(orphan) = orphan {
                self.delete_orphan(&orphan)?;
            }
        }
        Ok(())
    }

    fn delete_orphan(&mut self, orphan: &EntityHandle) -> Result<()> {
        let orphan = if orphan.is_uninitialized() {
            self.initialize_proxy(orphan)?
        } else {
            self.pc.unproxy(orphan)?
        };
        let live = self
            .pc
            .get_entry(&orphan)
            .is_some_and(|e| !e.status().is_deleted_or_gone());
        if !live {
            return Ok(());
        }
        tracing::debug!(entity = %orphan.entity_name(), id = %orphan.id(), "Deleting orphan");
        self.delete_internal(&orphan, true, &mut CascadeContext::new())
    }
}

fn has_cascades(properties: &[PropertyMetadata]) -> bool {
    properties.iter().any(|p| match &p.kind {
        PropertyKind::Component { properties } => has_cascades(properties),
        _ => p.cascade.has_any(),
    })
}

/// Same instance, looking through initialized proxies.
pub(crate) fn same_instance(a: &EntityHandle, b: &EntityHandle) -> bool {
    if a.ptr_eq(b) {
        return true;
    }
    match (a.implementation(), b.implementation()) {
        (Some(x), Some(y)) => x.ptr_eq(&y),
        _ => false,
    }
}
