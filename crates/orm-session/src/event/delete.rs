//! Delete.

use crate::Session;
use crate::action::EntityDeleteAction;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::entry::{EntityEntry, Status};
use crate::event::update::Reattach;
use crate::key::EntityKey;
use orm_core::{EntityHandle, Error, Result};
use std::sync::Arc;

impl Session {
    /// Schedule removal of an instance and, through cascades, its dependents.
    ///
    /// A detached instance is reattached first. An instance whose insert is
    /// still queued is simply forgotten.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn delete(&mut self, entity: &EntityHandle) -> Result<()> {
        self.check_open()?;
        self.delete_internal(entity, false, &mut CascadeContext::new())
    }

    pub(crate) fn delete_internal(
        &mut self,
        entity: &EntityHandle,
        orphan: bool,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        let entity = if entity.is_uninitialized() {
            self.initialize_proxy(entity)?
        } else {
            self.pc.unproxy_and_reassociate(entity)
        };
        if !ctx.visit(&entity) {
            return Ok(());
        }

        let entry = match self.pc.get_entry(&entity).cloned() {
            Some(entry) => entry,
            None => {
                let persister = self.persister_for(&entity)?;
                let id = persister.get_identifier(&entity);
                if id.is_null() {
                    return Err(Error::TransientObject(format!(
                        "the detached instance passed to delete() had a null identifier: {}",
                        persister.entity_name()
                    )));
                }
                if self.is_transient(&entity, None)? {
                    tracing::trace!(entity = %persister.entity_name(), "Deleting a transient instance");
                    return self.delete_transient(&entity, &persister, ctx);
                }
                self.reassociate(&entity, &persister, id, Reattach::Update, true)?;
                self.pc.get_entry(&entity).cloned().ok_or_else(|| {
                    Error::AssertionFailure("reattached instance has no entry".to_string())
                })?
            }
        };

        match entry.status() {
            Status::Deleted | Status::Gone => {
                tracing::trace!("Instance was already deleted");
                Ok(())
            }
            Status::Saving if self.action_queue.has_queued_insertion(&entity) => {
                self.delete_unflushed(&entity, &entry, ctx)
            }
            _ => self.delete_persistent(&entity, &entry, orphan, ctx),
        }
    }

    fn delete_transient(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn orm_core::EntityPersister>,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        self.cascade(
            CascadingAction::Delete,
            CascadePoint::AfterInsertBeforeDelete,
            persister,
            entity,
            ctx,
        )?;
        self.cascade(
            CascadingAction::Delete,
            CascadePoint::BeforeInsertAfterDelete,
            persister,
            entity,
            ctx,
        )
    }

    /// Forget an instance whose insert never ran.
    fn delete_unflushed(
        &mut self,
        entity: &EntityHandle,
        entry: &EntityEntry,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        let persister = Arc::clone(entry.persister());
        self.cascade(
            CascadingAction::Delete,
            CascadePoint::AfterInsertBeforeDelete,
            &persister,
            entity,
            ctx,
        )?;
        self.action_queue.un_schedule_insertion(entity);
        self.pc.remove_entry(entity);
        self.pc
            .remove_entity(&EntityKey::for_entity(persister.metadata(), entry.id().clone()));
        tracing::debug!(entity = %entry.entity_name(), id = %entry.id(), "Discarded unflushed insert");
        self.cascade(
            CascadingAction::Delete,
            CascadePoint::BeforeInsertAfterDelete,
            &persister,
            entity,
            ctx,
        )
    }

    fn delete_persistent(
        &mut self,
        entity: &EntityHandle,
        entry: &EntityEntry,
        orphan: bool,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        let persister = Arc::clone(entry.persister());
        let id = entry.id().clone();
        tracing::debug!(entity = %entry.entity_name(), id = %id, orphan, "Deleting instance");

        self.factory.interceptor().on_delete(entity, &id)?;
        self.cascade(
            CascadingAction::Delete,
            CascadePoint::AfterInsertBeforeDelete,
            &persister,
            entity,
            ctx,
        )?;

        let state = persister.get_property_values(entity)?;
        if let Some(e) = self.pc.get_entry_mut(entity) {
            e.set_status(Status::Deleted)?;
            e.set_deleted_state(state);
        }
        self.pc
            .register_nullifiable_key(EntityKey::for_entity(persister.metadata(), id.clone()));
        self.action_queue.add_delete(EntityDeleteAction::new(
            entity.clone(),
            id,
            entry.version().clone(),
            Arc::clone(&persister),
            orphan,
        ));

        self.cascade(
            CascadingAction::Delete,
            CascadePoint::BeforeInsertAfterDelete,
            &persister,
            entity,
            ctx,
        )
    }
}
