//! Update: reattach a detached instance.

use crate::Session;
use crate::action::{CollectionAction, CollectionActionKind};
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::entry::Status;
use crate::key::EntityKey;
use orm_core::{
    EntityHandle, EntityPersister, Error, LockMode, PropertyKind, PropertyValue, Result, Value,
};
use std::sync::Arc;

/// What reattaching does with a collection that has no persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reattach {
    /// Rewrite it: the rows are removed now and recreated at flush.
    Update,
    /// Reject it: a lock must not carry unflushed collection changes.
    Lock,
}

impl Session {
    /// Reattach a detached instance so its state is written at the next
    /// flush.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn update(&mut self, entity: &EntityHandle) -> Result<()> {
        self.check_open()?;
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            return Ok(());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        match self.pc.get_entry(&entity) {
            Some(entry) if entry.status().is_deleted_or_gone() => Err(Error::object_deleted(
                entry.entity_name(),
                entry.id(),
                "deleted instance passed to update()",
            )),
            Some(_) => {
                tracing::trace!("Ignoring persistent instance passed to update()");
                Ok(())
            }
            None => self.reattach(&entity),
        }
    }

    /// Associate a detached instance with this session. Its loaded state is
    /// unknown, so the next flush writes every property.
    pub(crate) fn reattach(&mut self, entity: &EntityHandle) -> Result<()> {
        let persister = self.persister_for(entity)?;
        let id = persister.get_identifier(entity);
        if id.is_null() {
            return Err(Error::TransientObject(format!(
                "the given object has a null identifier: {}",
                persister.entity_name()
            )));
        }
        tracing::debug!(entity = %persister.entity_name(), id = %id, "Updating detached instance");
        self.reassociate(entity, &persister, id, Reattach::Update, false)?;
        self.cascade(
            CascadingAction::SaveUpdate,
            CascadePoint::AfterUpdate,
            &persister,
            entity,
            &mut CascadeContext::new(),
        )
    }

    /// Register an entry for a detached instance and reattach its collections.
    ///
    /// With `snapshot_current` the current state becomes the loaded state, so
    /// nothing is written unless the instance changes afterwards.
    pub(crate) fn reassociate(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        id: Value,
        mode: Reattach,
        snapshot_current: bool,
    ) -> Result<()> {
        let metadata = Arc::clone(persister.metadata());
        let key = EntityKey::for_entity(&metadata, id.clone());
        self.pc.check_uniqueness(&key, entity)?;
        let status = if metadata.mutable {
            Status::Managed
        } else {
            Status::ReadOnly
        };
        let loaded_state = if snapshot_current {
            Some(persister.get_property_values(entity)?)
        } else {
            None
        };
        self.pc.add_entity_with_entry(
            entity,
            key,
            status,
            loaded_state,
            persister.get_version(entity),
            LockMode::None,
            true,
            Arc::clone(persister),
            false,
        );
        self.reattach_collections(entity, persister, &id, mode)
    }

    fn reattach_collections(
        &mut self,
        owner: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        id: &Value,
        mode: Reattach,
    ) -> Result<()> {
        let metadata = Arc::clone(persister.metadata());
        let state = persister.get_property_values(owner)?;
        for (property, value) in metadata.properties.iter().zip(state) {
            let PropertyKind::Collection { role } = &property.kind else {
                continue;
            };
            let PropertyValue::Collection(Some(collection)) = value else {
                continue;
            };
            if self.pc.get_collection_entry(&collection).is_some() {
                continue;
            }
            let previously_flushed =
                collection.role() == *role && collection.key().same_identifier(id);
            if previously_flushed && !(mode == Reattach::Lock && collection.is_dirty()) {
                if collection.is_initialized() {
                    let snapshot = collection
                        .stored_snapshot()
                        .or_else(|| Some(collection.loaded_elements()));
                    self.pc
                        .add_loaded_collection(&collection, Some(owner), role, id.clone(), snapshot);
                } else {
                    self.pc
                        .add_uninitialized_collection(&collection, Some(owner), role, id.clone());
                }
                continue;
            }
            match mode {
                Reattach::Lock => {
                    return Err(Error::Usage(format!(
                        "reassociated object has dirty collection: {role}"
                    )));
                }
                Reattach::Update => {
                    tracing::trace!(role = %role, key = %id, "Scheduling removal of replaced collection");
                    let collection_persister = self.factory.collection_persister(role)?;
                    self.action_queue.add_collection_action(CollectionAction::new(
                        CollectionActionKind::Remove,
                        None,
                        Some(owner.clone()),
                        id.clone(),
                        collection_persister,
                    ));
                }
            }
        }
        Ok(())
    }
}
