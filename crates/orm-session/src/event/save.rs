//! Save, persist and save-or-update.

use crate::Session;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::entry::Status;
use crate::event::EntityState;
use crate::key::EntityKey;
use orm_core::{
    EntityHandle, EntityPersister, Error, IdGeneration, LockMode, Result, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PLACEHOLDER: AtomicU64 = AtomicU64::new(1);

fn next_placeholder() -> Value {
    Value::Generated(NEXT_PLACEHOLDER.fetch_add(1, Ordering::Relaxed))
}

impl Session {
    /// Make a transient instance persistent and return its identifier.
    ///
    /// The identifier comes from the generator, or from the instance for
    /// assigned ids. With delayed identity inserts the returned value is a
    /// placeholder until the insert runs.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn save(&mut self, entity: &EntityHandle) -> Result<Value> {
        self.check_open()?;
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            return Ok(entity.id());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        match self.pc.get_entry(&entity).map(|e| (e.status(), e.id().clone())) {
            Some((status, id)) if !status.is_deleted_or_gone() => Ok(id),
            Some(_) => {
                self.force_flush()?;
                self.save_transient(&entity, None, CascadingAction::SaveUpdate, &mut CascadeContext::new())
            }
            None => self.save_transient(&entity, None, CascadingAction::SaveUpdate, &mut CascadeContext::new()),
        }
    }

    /// Save a transient instance or reattach a detached one.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn save_or_update(&mut self, entity: &EntityHandle) -> Result<()> {
        self.check_open()?;
        self.save_or_update_internal(entity).map(drop)
    }

    pub(crate) fn save_or_update_internal(&mut self, entity: &EntityHandle) -> Result<Value> {
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            return Ok(entity.id());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        match self.entity_state(&entity, None)? {
            EntityState::Persistent => Ok(self
                .pc
                .get_entry(&entity)
                .map_or_else(|| entity.id(), |e| e.id().clone())),
            EntityState::Detached => {
                self.reattach(&entity)?;
                Ok(entity.id())
            }
            EntityState::Deleted => {
                self.force_flush()?;
                self.save_transient(&entity, None, CascadingAction::SaveUpdate, &mut CascadeContext::new())
            }
            EntityState::Transient => {
                self.save_transient(&entity, None, CascadingAction::SaveUpdate, &mut CascadeContext::new())
            }
        }
    }

    /// Make a transient instance persistent without returning its id.
    /// Detached and deleted instances are rejected.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn persist(&mut self, entity: &EntityHandle) -> Result<()> {
        self.check_open()?;
        self.persist_internal(entity, &mut CascadeContext::new())
    }

    pub(crate) fn persist_internal(
        &mut self,
        entity: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            return Ok(());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        if !ctx.visit(&entity) {
            return Ok(());
        }
        match self.entity_state(&entity, None)? {
            EntityState::Persistent => {
                let persister = self.persister_for(&entity)?;
                self.cascade(
                    CascadingAction::Persist,
                    CascadePoint::BeforeInsertAfterDelete,
                    &persister,
                    &entity,
                    ctx,
                )?;
                self.cascade(
                    CascadingAction::Persist,
                    CascadePoint::AfterInsertBeforeDelete,
                    &persister,
                    &entity,
                    ctx,
                )
            }
            EntityState::Transient => self
                .save_transient(&entity, None, CascadingAction::Persist, ctx)
                .map(drop),
            EntityState::Detached => Err(Error::Usage(format!(
                "detached entity passed to persist: {}#{}",
                entity.entity_name(),
                entity.id()
            ))),
            EntityState::Deleted => Err(Error::object_deleted(
                &entity.entity_name(),
                &entity.id(),
                "deleted instance passed to persist",
            )),
        }
    }

    /// Flush so a deleted row is gone before its identifier is reused.
    pub(crate) fn force_flush(&mut self) -> Result<()> {
        if self.pc.cascade_level() > 0 {
            return Err(Error::Usage(
                "deleted object would be re-saved by cascade (remove deleted object from associations)"
                    .to_string(),
            ));
        }
        tracing::debug!("Flushing to remove a deleted instance before it is saved again");
        self.flush()
    }

    /// Generate or take the identifier of a transient instance and schedule its insert.
    pub(crate) fn save_transient(
        &mut self,
        entity: &EntityHandle,
        requested_id: Option<Value>,
        action: CascadingAction,
        ctx: &mut CascadeContext,
    ) -> Result<Value> {
        let persister = self.persister_for(entity)?;
        let metadata = Arc::clone(persister.metadata());
        let (id, identity) = match requested_id {
            Some(id) => (id, false),
            None => match metadata.id_generation {
                IdGeneration::Assigned => {
                    let id = persister.get_identifier(entity);
                    if id.is_null() {
                        return Err(Error::Usage(format!(
                            "ids for this class must be manually assigned before calling save(): {}",
                            metadata.name
                        )));
                    }
                    (id, false)
                }
                IdGeneration::Sequence => (persister.generate_identifier()?, false),
                IdGeneration::Identity => (next_placeholder(), true),
            },
        };

        if !identity {
            let key = EntityKey::for_entity(&metadata, id.clone());
            if let Some(existing) = self.pc.get_entity(&key) {
                let deleted = self
                    .pc
                    .get_entry(&existing)
                    .is_some_and(|e| e.status().is_deleted_or_gone());
                if !deleted {
                    return Err(Error::non_unique(&metadata.name, &id));
                }
                self.force_flush()?;
            }
        }
        persister.set_identifier(entity, &id);
        tracing::debug!(entity = %metadata.name, id = %id, identity, "Saving transient instance");

        self.factory.interceptor().on_save(entity, &id)?;
        self.callbacks.fire_pre_insert(entity)?;
        self.perform_save(entity, id, &persister, identity, action, ctx)
    }

    fn perform_save(
        &mut self,
        entity: &EntityHandle,
        id: Value,
        persister: &Arc<dyn EntityPersister>,
        identity: bool,
        action: CascadingAction,
        ctx: &mut CascadeContext,
    ) -> Result<Value> {
        let metadata = Arc::clone(persister.metadata());
        let key = EntityKey::for_entity(&metadata, id.clone());
        self.pc.add_entity_with_entry(
            entity,
            key,
            Status::Saving,
            None,
            persister.get_version(entity),
            LockMode::Write,
            false,
            Arc::clone(persister),
            false,
        );

        self.cascade(
            action,
            CascadePoint::BeforeInsertAfterDelete,
            persister,
            entity,
            ctx,
        )?;

        let version = match &metadata.version {
            Some(version) => {
                let current = persister.get_version(entity);
                let unsaved = version
                    .unsaved_value
                    .is_unsaved(&current)
                    .unwrap_or_else(|| current.is_null());
                if unsaved {
                    let seed = version.version_type.seed();
                    entity.set_version(seed.clone());
                    seed
                } else {
                    current
                }
            }
            None => Value::Null,
        };
        let state = persister.get_property_values(entity)?;
        if let Some(entry) = self.pc.get_entry_mut(entity) {
            entry.set_loaded_state(Some(state.clone()));
            entry.set_version(version.clone());
        }

        let insert = crate::action::EntityInsertAction::new(
            entity.clone(),
            id,
            state,
            version,
            Arc::clone(persister),
        );
        if identity && !self.factory.options().delay_identity_inserts {
            let (mut exec, queue) = self.execution_context();
            queue.execute_insert_now(insert, &mut exec)?;
        } else {
            self.action_queue.add_insert(insert);
        }

        self.cascade(
            action,
            CascadePoint::AfterInsertBeforeDelete,
            persister,
            entity,
            ctx,
        )?;
        Ok(entity.id())
    }
}
