//! Flush: dirty-check every managed instance and collection, then execute
//! the action queue.

use crate::action::{CollectionAction, CollectionActionKind, EntityUpdateAction};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction, same_instance};
use crate::collection_entry::CollectionEntry;
use crate::config::FlushMode;
use crate::entry::{EntityEntry, Status};
use crate::key::{CollectionKey, EntityKey};
use crate::{Session, SessionEvent};
use orm_core::{
    CollectionHandle, Element, EntityHandle, EntityMetadata, EntityPersister, Error,
    PropertyKind, PropertyMetadata, PropertyValue, Result, Value, disassemble,
};
use std::sync::Arc;

impl Session {
    /// Write every pending change to the database.
    ///
    /// Cascades save-update from managed instances, schedules updates for
    /// dirty instances and writes for changed collections, executes the
    /// queue and refreshes every snapshot. A failed action aborts the flush
    /// with the failed action and its successors still queued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.pc.cascade_level() > 0 {
            return Err(Error::Usage("flush during cascade is dangerous".to_string()));
        }
        self.callbacks.fire(SessionEvent::BeforeFlush)?;
        tracing::debug!(
            entities = self.pc.entry_count(),
            collections = self.pc.collection_count(),
            "Flushing session"
        );
        self.flush_everything_to_executions(true)?;
        self.execute_flush()
    }

    /// Flush when the queue would write any of `spaces` (entity names or
    /// collection roles). Returns whether a flush ran.
    ///
    /// Only `Auto` and `Always` sessions flush here; `Always` flushes even
    /// when nothing relevant is queued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn auto_flush_if_needed(&mut self, spaces: &[&str]) -> Result<bool> {
        self.check_open()?;
        let mode = self.config.flush_mode;
        if !matches!(mode, FlushMode::Auto | FlushMode::Always) || self.pc.cascade_level() > 0 {
            return Ok(false);
        }
        let previous = self.action_queue.counts();
        self.flush_everything_to_executions(true)?;
        let needed = mode == FlushMode::Always || self.action_queue.are_tables_to_be_updated(spaces);
        if !needed {
            tracing::trace!("Auto-flush not needed");
            self.action_queue.clear_from_flush_needed_check(previous);
            return Ok(false);
        }
        tracing::debug!(?spaces, "Auto-flushing");
        self.callbacks.fire(SessionEvent::BeforeFlush)?;
        self.execute_flush()?;
        Ok(true)
    }

    fn execute_flush(&mut self) -> Result<()> {
        self.perform_executions()?;
        self.post_flush()?;
        self.factory.statistics().flush();
        tracing::debug!("Flush complete");
        self.callbacks.fire(SessionEvent::AfterFlush)
    }

    // ========================================================================
    // Action generation
    // ========================================================================

    /// Turn pending changes into queued actions without executing them.
    ///
    /// `cascade` runs save-update cascades first and rejects references to
    /// unsaved instances; dirty checking passes `false` so the walk leaves
    /// the context untouched apart from the actions it queues.
    pub(crate) fn flush_everything_to_executions(&mut self, cascade: bool) -> Result<()> {
        self.pc.set_flushing(true);
        let result = self.flush_to_executions(cascade);
        self.pc.set_flushing(false);
        result
    }

    fn flush_to_executions(&mut self, cascade: bool) -> Result<()> {
        if cascade {
            self.prepare_entity_flushes()?;
        }
        self.prepare_collection_flushes()?;
        self.flush_entities(cascade)?;
        self.flush_collections(cascade)
    }

    fn prepare_entity_flushes(&mut self) -> Result<()> {
        for (entity, entry) in self.pc.entries_snapshot() {
            if !matches!(
                entry.status(),
                Status::Managed | Status::Saving | Status::ReadOnly
            ) {
                continue;
            }
            let persister = Arc::clone(entry.persister());
            self.cascade(
                CascadingAction::SaveUpdate,
                CascadePoint::BeforeFlush,
                &persister,
                &entity,
                &mut CascadeContext::new(),
            )?;
        }
        Ok(())
    }

    fn prepare_collection_flushes(&mut self) -> Result<()> {
        for collection in self.pc.collection_handles() {
            let role = self
                .pc
                .get_collection_entry(&collection)
                .and_then(|e| e.loaded_role().map(str::to_string))
                .unwrap_or_else(|| collection.role());
            let mutable = self.factory.collection_persister(&role)?.metadata().mutable;
            if let Some(entry) = self.pc.get_collection_entry_mut(&collection) {
                entry.pre_flush(&collection, mutable)?;
            }
        }
        Ok(())
    }

    fn flush_entities(&mut self, cascade: bool) -> Result<()> {
        for (entity, entry) in self.pc.entries_snapshot() {
            if entry.status().is_deleted_or_gone() {
                continue;
            }
            let persister = Arc::clone(entry.persister());
            let state = persister.get_property_values(&entity)?;
            self.reach_collections(&entity, entry.id(), &persister.metadata().properties, &state)?;
            if !entry.requires_dirty_check() {
                continue;
            }
            if cascade && (entry.status() == Status::Saving || entity.is_modified()) {
                self.check_transient_references(&persister, &state)?;
            }
            self.schedule_update_if_dirty(&entity, &entry, &persister, state)?;
        }
        Ok(())
    }

    /// Mark every collection the instance references as reached, attaching
    /// collections the session has not seen yet.
    fn reach_collections(
        &mut self,
        owner: &EntityHandle,
        id: &Value,
        properties: &[PropertyMetadata],
        state: &[PropertyValue],
    ) -> Result<()> {
        for (property, value) in properties.iter().zip(state) {
            let PropertyKind::Collection { role } = &property.kind else {
                continue;
            };
            let Some(collection) = value.as_collection() else {
                continue;
            };
            if self.pc.get_collection_entry(collection).is_none() {
                tracing::trace!(role = %role, owner = %id, "Attaching new collection");
                self.pc.add_new_collection(collection, owner);
            }
            if let Some(entry) = self.pc.get_collection_entry_mut(collection) {
                if entry.owner().is_none() {
                    entry.set_owner(owner);
                }
                entry.reach(role, id.clone())?;
            }
        }
        Ok(())
    }

    fn check_transient_references(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        state: &[PropertyValue],
    ) -> Result<()> {
        let mut referenced = Vec::new();
        collect_to_one(&persister.metadata().properties, state, &mut referenced);
        for reference in referenced {
            self.check_saved(&reference, persister.entity_name())?;
        }
        Ok(())
    }

    fn check_saved(&mut self, reference: &EntityHandle, owner_name: &str) -> Result<()> {
        if reference.is_uninitialized() {
            return Ok(());
        }
        let target = self.pc.unproxy(reference)?;
        if self.pc.is_entry_for(&target) {
            return Ok(());
        }
        if self.is_transient(&target, None)? {
            return Err(Error::TransientObject(format!(
                "object references an unsaved transient instance - save the transient instance before flushing: {} -> {}",
                owner_name,
                target.entity_name()
            )));
        }
        Ok(())
    }

    fn schedule_update_if_dirty(
        &mut self,
        entity: &EntityHandle,
        entry: &EntityEntry,
        persister: &Arc<dyn EntityPersister>,
        state: Vec<PropertyValue>,
    ) -> Result<()> {
        let metadata = Arc::clone(persister.metadata());
        let dirty = self.find_dirty(entity, entry, persister, &metadata, &state)?;
        let dirty_collections = self.has_dirty_collections(entry, &metadata, &state);
        let all_dirty = dirty.is_none();
        let dirty = dirty.unwrap_or_else(|| {
            metadata
                .properties
                .iter()
                .enumerate()
                .filter(|(_, p)| p.updatable)
                .map(|(i, _)| i)
                .collect()
        });
        if dirty.is_empty() && !dirty_collections && !all_dirty {
            return Ok(());
        }

        let next_version =
            self.next_version(entity, entry, persister, &metadata, &dirty, all_dirty || dirty_collections)?;
        tracing::debug!(
            entity = %metadata.name,
            id = %entry.id(),
            dirty = ?dirty,
            dirty_collections,
            "Scheduling update"
        );
        self.action_queue.add_update(EntityUpdateAction::new(
            entity.clone(),
            entry.id().clone(),
            state,
            dirty,
            entry.version().clone(),
            next_version,
            Arc::clone(persister),
        ));
        Ok(())
    }

    /// Indexes of properties that differ from the loaded state. `None`
    /// means the loaded state is unknown and every property counts as dirty.
    fn find_dirty(
        &mut self,
        entity: &EntityHandle,
        entry: &EntityEntry,
        persister: &Arc<dyn EntityPersister>,
        metadata: &EntityMetadata,
        state: &[PropertyValue],
    ) -> Result<Option<Vec<usize>>> {
        if let Some(loaded) = entry.loaded_state() {
            if !entity.is_modified() {
                return Ok(Some(Vec::new()));
            }
            let dirty = metadata
                .properties
                .iter()
                .enumerate()
                .filter(|(i, p)| {
                    p.updatable
                        && match (state.get(*i), loaded.get(*i)) {
                            (Some(current), Some(previous)) => !property_equal(current, previous),
                            _ => true,
                        }
                })
                .map(|(i, _)| i)
                .collect();
            return Ok(Some(dirty));
        }
        if !metadata.select_before_update {
            return Ok(None);
        }
        let key = EntityKey::for_entity(metadata, entry.id().clone());
        let Some(snapshot) = self.pc.get_database_snapshot(&key, persister.as_ref())? else {
            return Err(Error::stale_state(&metadata.name, entry.id()));
        };
        let current = disassemble(state);
        let dirty = metadata
            .properties
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                p.updatable
                    && match (current.get(*i), snapshot.get(*i)) {
                        (Some(a), Some(b)) => !same_value(a, b),
                        _ => true,
                    }
            })
            .map(|(i, _)| i)
            .collect();
        Ok(Some(dirty))
    }

    /// Does a change to one of the instance's collections require a
    /// version increment?
    fn has_dirty_collections(
        &self,
        entry: &EntityEntry,
        metadata: &EntityMetadata,
        state: &[PropertyValue],
    ) -> bool {
        if !metadata.is_versioned()
            || !entry.exists_in_database()
            || !self.factory.options().version_increment_on_collection_change
        {
            return false;
        }
        metadata.properties.iter().zip(state).any(|(property, value)| {
            if !property.optimistic_lock {
                return false;
            }
            let Some(collection) = value.as_collection() else {
                return false;
            };
            self.pc
                .get_collection_entry(collection)
                .is_none_or(|e| e.loaded_role().is_none() || e.is_dirty(collection))
        })
    }

    fn next_version(
        &self,
        entity: &EntityHandle,
        entry: &EntityEntry,
        persister: &Arc<dyn EntityPersister>,
        metadata: &EntityMetadata,
        dirty: &[usize],
        forced: bool,
    ) -> Result<Value> {
        let Some(version_type) = metadata.version_type() else {
            return Ok(Value::Null);
        };
        if entry.is_version_increment_disabled() {
            return Ok(persister.get_version(entity));
        }
        let increment = forced
            || dirty
                .iter()
                .any(|i| metadata.properties.get(*i).is_some_and(|p| p.optimistic_lock));
        if increment {
            version_type.next(entry.version())
        } else {
            Ok(entry.version().clone())
        }
    }

    fn flush_collections(&mut self, cascade: bool) -> Result<()> {
        for collection in self.pc.collection_handles() {
            let Some(entry) = self.pc.get_collection_entry(&collection).cloned() else {
                continue;
            };
            if entry.is_ignore() {
                continue;
            }
            if !entry.is_reached() {
                self.check_dereferenced(&collection, &entry)?;
            }
            let Some(entry) = self.pc.get_collection_entry_mut(&collection) else {
                continue;
            };
            if !entry.is_reached() {
                entry.dereference();
            }
            entry.prepare_for_update(&collection)?;
            let entry = entry.clone();
            self.schedule_collection_actions(&collection, &entry, cascade)?;
        }
        Ok(())
    }

    /// A collection no owner references any more. With orphan removal the
    /// owner must have been deleted or evicted: replacing the collection
    /// instance would lose track of the orphans.
    fn check_dereferenced(&self, collection: &CollectionHandle, entry: &CollectionEntry) -> Result<()> {
        let Some(role) = entry.loaded_role() else {
            return Ok(());
        };
        if !self.factory.is_orphan_delete(role) {
            return Ok(());
        }
        let owner_live = entry.owner().is_some_and(|owner| {
            self.pc
                .get_entry(owner)
                .is_some_and(|e| !e.status().is_deleted_or_gone())
        });
        if owner_live {
            return Err(Error::Usage(format!(
                "a collection with cascade=\"all-delete-orphan\" was no longer referenced by the owning entity instance: {}",
                collection.role()
            )));
        }
        Ok(())
    }

    fn schedule_collection_actions(
        &mut self,
        collection: &CollectionHandle,
        entry: &CollectionEntry,
        cascade: bool,
    ) -> Result<()> {
        let owner = entry.owner().cloned();
        if entry.is_do_update() {
            if cascade {
                self.check_elements_saved(collection)?;
            }
            self.queue_collection_action(
                CollectionActionKind::Update,
                collection,
                owner.clone(),
                entry.loaded_role(),
                entry.loaded_key(),
            )?;
        }
        if entry.is_do_remove() {
            self.queue_collection_action(
                CollectionActionKind::Remove,
                collection,
                owner.clone(),
                entry.loaded_role(),
                entry.loaded_key(),
            )?;
        }
        if entry.is_do_recreate() {
            if cascade {
                self.check_elements_saved(collection)?;
            }
            self.queue_collection_action(
                CollectionActionKind::Recreate,
                collection,
                owner,
                entry.current_role(),
                entry.current_key(),
            )?;
        }
        Ok(())
    }

    fn queue_collection_action(
        &mut self,
        kind: CollectionActionKind,
        collection: &CollectionHandle,
        owner: Option<EntityHandle>,
        role: Option<&str>,
        key: Option<&Value>,
    ) -> Result<()> {
        let (Some(role), Some(key)) = (role, key) else {
            return Err(Error::AssertionFailure(format!(
                "{kind:?} scheduled for {} without a role and key",
                collection.role()
            )));
        };
        let persister = self.factory.collection_persister(role)?;
        self.action_queue.add_collection_action(CollectionAction::new(
            kind,
            Some(collection.clone()),
            owner,
            key.clone(),
            persister,
        ));
        Ok(())
    }

    fn check_elements_saved(&mut self, collection: &CollectionHandle) -> Result<()> {
        if !collection.is_initialized() {
            return Ok(());
        }
        let role = collection.role();
        for element in collection.loaded_elements() {
            if let Element::Entity(e) = element {
                self.check_saved(&e, &role)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn perform_executions(&mut self) -> Result<()> {
        self.pc.set_flushing(true);
        let result = {
            let (mut ctx, queue) = self.execution_context();
            queue.execute_actions(&mut ctx)
        };
        self.pc.set_flushing(false);
        result
    }

    /// Bring every entry in line with what was written.
    fn post_flush(&mut self) -> Result<()> {
        let collections = self.pc.collection_handles();
        for collection in &collections {
            let Some(entry) = self.pc.get_collection_entry_mut(collection) else {
                continue;
            };
            entry.post_flush(collection)?;
            let unreferenced = entry.loaded_key().is_none();
            if unreferenced {
                self.pc.remove_collection_entry(collection);
            }
        }

        self.pc.clear_collections_by_key();
        for collection in self.pc.collection_handles() {
            let key = self.pc.get_collection_entry(&collection).and_then(|e| {
                match (e.loaded_role(), e.loaded_key()) {
                    (Some(role), Some(key)) => Some(CollectionKey::new(role, key.clone())),
                    _ => None,
                }
            });
            if let Some(key) = key {
                self.pc.add_collection_by_key(key, &collection);
            }
        }
        self.pc.clear_nullifiable_keys();

        let managed: Vec<EntityHandle> = self
            .pc
            .entries_snapshot()
            .into_iter()
            .filter(|(_, e)| !e.status().is_deleted_or_gone())
            .map(|(entity, _)| entity)
            .collect();
        for entity in &managed {
            entity.clear_modified();
        }
        self.callbacks.fire_post_flush(&managed)
    }
}

/// To-one references in a state, including those nested in components.
fn collect_to_one(
    properties: &[PropertyMetadata],
    state: &[PropertyValue],
    into: &mut Vec<EntityHandle>,
) {
    for (property, value) in properties.iter().zip(state) {
        match (&property.kind, value) {
            (PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. }, PropertyValue::Entity(Some(e))) => {
                into.push(e.clone());
            }
            (PropertyKind::Component { properties }, PropertyValue::Component(Some(nested))) => {
                collect_to_one(properties, nested, into);
            }
            _ => {}
        }
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    a == b || a.same_identifier(b)
}

/// Property equality as dirty checking sees it. Collections are compared
/// through their own entries, never here.
pub(crate) fn property_equal(current: &PropertyValue, loaded: &PropertyValue) -> bool {
    match (current, loaded) {
        (PropertyValue::Value(a), PropertyValue::Value(b)) => same_value(a, b),
        (PropertyValue::Entity(None), PropertyValue::Entity(None)) => true,
        (PropertyValue::Entity(Some(a)), PropertyValue::Entity(Some(b))) => {
            same_instance(a, b)
                || (a.metadata().root_name() == b.metadata().root_name()
                    && !a.id().is_null()
                    && a.id().same_identifier(&b.id()))
        }
        (PropertyValue::Collection(_), PropertyValue::Collection(_)) => true,
        (PropertyValue::Component(None), PropertyValue::Component(None)) => true,
        (PropertyValue::Component(Some(a)), PropertyValue::Component(Some(b))) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| property_equal(x, y))
        }
        _ => false,
    }
}
