//! Merge: copy the state of a transient or detached instance onto a
//! managed one.

use crate::Session;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::collection_entry::same_elements;
use crate::event::{CopyCache, EntityState};
use crate::key::EntityKey;
use orm_core::{
    CollectionHandle, Element, EntityErrorInfo, EntityHandle, EntityPersister, Error,
    ForeignKeyDirection, LockMode, PropertyKind, PropertyMetadata, PropertyValue, Result,
};
use std::sync::Arc;

impl Session {
    /// Copy the state of `entity` onto the managed instance with the same
    /// identifier, loading or creating it as needed, and return that
    /// managed instance. `entity` itself stays unmanaged.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn merge(&mut self, entity: &EntityHandle) -> Result<EntityHandle> {
        self.check_open()?;
        self.merge_internal(entity, &mut CascadeContext::new())
    }

    /// Merge with a caller-supplied copy cache, so several merges share one
    /// original-to-copy map.
    pub fn merge_with_copy_cache(
        &mut self,
        entity: &EntityHandle,
        copy_cache: &mut CopyCache,
    ) -> Result<EntityHandle> {
        self.check_open()?;
        let mut ctx = CascadeContext::with_copy_cache(std::mem::take(copy_cache));
        let result = self.merge_internal(entity, &mut ctx);
        *copy_cache = ctx.copy_cache;
        result
    }

    pub(crate) fn merge_internal(
        &mut self,
        entity: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<EntityHandle> {
        if entity.is_uninitialized() {
            tracing::trace!("Merging an uninitialized proxy");
            return self.load(&entity.entity_name(), entity.id());
        }
        let entity = self.pc.unproxy(entity)?;
        if let Some(copy) = ctx.copy_cache.get(&entity) {
            return Ok(copy);
        }
        if ctx.copy_cache.contains_copy(&entity) {
            return Ok(entity);
        }

        let state = match self.pc.get_entry(&entity) {
            Some(entry) if entry.status().is_deleted_or_gone() => {
                return Err(Error::object_deleted(
                    entry.entity_name(),
                    entry.id(),
                    "deleted instance passed to merge",
                ));
            }
            Some(_) => EntityState::Persistent,
            None if self.managed_instance_with_same_id(&entity)? => EntityState::Detached,
            None => self.entity_state(&entity, None)?,
        };
        tracing::debug!(entity = %entity.entity_name(), state = %state, "Merging");
        match state {
            EntityState::Persistent => self.merge_persistent(&entity, ctx),
            EntityState::Detached => self.merge_detached(&entity, ctx),
            EntityState::Transient => self.merge_transient(&entity, ctx),
            EntityState::Deleted => Err(Error::object_deleted(
                &entity.entity_name(),
                &entity.id(),
                "deleted instance passed to merge",
            )),
        }
    }

    fn managed_instance_with_same_id(&self, entity: &EntityHandle) -> Result<bool> {
        let id = entity.id();
        if id.is_null() {
            return Ok(false);
        }
        let key = EntityKey::for_entity(&entity.metadata(), id);
        Ok(self.pc.get_entity(&key).is_some_and(|managed| {
            self.pc
                .get_entry(&managed)
                .is_some_and(|e| !e.status().is_deleted_or_gone())
        }))
    }

    fn merge_persistent(
        &mut self,
        entity: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<EntityHandle> {
        let persister = self.persister_for(entity)?;
        ctx.copy_cache.insert(entity, entity);
        self.cascade(
            CascadingAction::Merge,
            CascadePoint::BeforeMerge,
            &persister,
            entity,
            ctx,
        )?;
        self.copy_values(&persister, entity, entity, None, ctx)?;
        Ok(entity.clone())
    }

    fn merge_transient(
        &mut self,
        entity: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<EntityHandle> {
        let persister = self.persister_for(entity)?;
        let copy = persister.instantiate(&persister.get_identifier(entity));
        copy.set_version(persister.get_version(entity));
        ctx.copy_cache.insert(entity, &copy);

        self.cascade(
            CascadingAction::Merge,
            CascadePoint::BeforeInsertAfterDelete,
            &persister,
            entity,
            ctx,
        )?;
        self.copy_values(
            &persister,
            entity,
            &copy,
            Some(ForeignKeyDirection::FromParent),
            ctx,
        )?;
        self.save_transient(&copy, None, CascadingAction::Merge, ctx)?;
        self.cascade(
            CascadingAction::Merge,
            CascadePoint::AfterInsertBeforeDelete,
            &persister,
            entity,
            ctx,
        )?;
        self.copy_values(
            &persister,
            entity,
            &copy,
            Some(ForeignKeyDirection::ToParent),
            ctx,
        )?;
        Ok(copy)
    }

    fn merge_detached(
        &mut self,
        entity: &EntityHandle,
        ctx: &mut CascadeContext,
    ) -> Result<EntityHandle> {
        let persister = self.persister_for(entity)?;
        let id = persister.get_identifier(entity);
        let Some(result) = self.get_internal(persister.entity_name(), &id, LockMode::None)? else {
            tracing::debug!(
                entity = %persister.entity_name(),
                id = %id,
                "Detached instance not found; merging as transient"
            );
            return self.merge_transient(entity, ctx);
        };
        ctx.copy_cache.insert(entity, &result);
        let target = self.pc.unproxy(&result)?;

        if !target.metadata().is_instance_of(persister.entity_name()) {
            return Err(Error::WrongClass(EntityErrorInfo::new(
                persister.entity_name(),
                Some(id),
                "merged instance and managed instance are of different classes",
            )));
        }
        if self.is_version_changed(&persister, entity, &target) {
            self.factory.statistics().optimistic_failure();
            return Err(Error::stale_state(persister.entity_name(), &id));
        }

        self.cascade(
            CascadingAction::Merge,
            CascadePoint::BeforeMerge,
            &persister,
            entity,
            ctx,
        )?;
        self.copy_values(&persister, entity, &target, None, ctx)?;
        target.mark_modified();
        Ok(result)
    }

    /// Do the versions differ while the target reflects a row? An instance
    /// saved earlier in this session may be merged without a version match.
    fn is_version_changed(
        &self,
        persister: &Arc<dyn EntityPersister>,
        entity: &EntityHandle,
        target: &EntityHandle,
    ) -> bool {
        let Some(version_type) = persister.version_type() else {
            return false;
        };
        let changed =
            !version_type.is_equal(&persister.get_version(target), &persister.get_version(entity));
        changed
            && self
                .pc
                .get_entry(target)
                .is_none_or(|e| e.exists_in_database())
    }

    // ========================================================================
    // State copy
    // ========================================================================

    /// Copy property values from `source` onto `target`, replacing
    /// references with their managed counterparts. `direction` limits the
    /// copied associations; plain values are always copied.
    fn copy_values(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        source: &EntityHandle,
        target: &EntityHandle,
        direction: Option<ForeignKeyDirection>,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        let metadata = Arc::clone(persister.metadata());
        let source_state = persister.get_property_values(source)?;
        let target_state = persister.get_property_values(target)?;
        let replaced =
            self.replace_values(&metadata.properties, &source_state, &target_state, direction, ctx)?;
        persister.set_property_values(target, replaced)
    }

    fn replace_values(
        &mut self,
        properties: &[PropertyMetadata],
        source: &[PropertyValue],
        target: &[PropertyValue],
        direction: Option<ForeignKeyDirection>,
        ctx: &mut CascadeContext,
    ) -> Result<Vec<PropertyValue>> {
        let mut replaced = Vec::with_capacity(properties.len());
        for (i, property) in properties.iter().enumerate() {
            let original = source
                .get(i)
                .cloned()
                .unwrap_or_else(|| PropertyValue::null_for(&property.kind));
            let existing = target
                .get(i)
                .cloned()
                .unwrap_or_else(|| PropertyValue::null_for(&property.kind));
            let copied = direction.is_none_or(|d| match property.kind.foreign_key_direction() {
                Some(fk) => fk == d,
                None => true,
            });
            if !copied {
                replaced.push(existing);
                continue;
            }
            replaced.push(self.replace_value(&property.kind, &original, &existing, ctx)?);
        }
        Ok(replaced)
    }

    fn replace_value(
        &mut self,
        kind: &PropertyKind,
        original: &PropertyValue,
        existing: &PropertyValue,
        ctx: &mut CascadeContext,
    ) -> Result<PropertyValue> {
        match (kind, original) {
            (_, PropertyValue::Value(v)) => Ok(PropertyValue::Value(v.clone())),
            (_, PropertyValue::Entity(None)) => Ok(PropertyValue::Entity(None)),
            (_, PropertyValue::Entity(Some(e))) => {
                Ok(PropertyValue::Entity(Some(self.resolve_merged_reference(e, ctx)?)))
            }
            (_, PropertyValue::Collection(None)) => Ok(PropertyValue::Collection(None)),
            (_, PropertyValue::Collection(Some(c))) => {
                let current = existing.as_collection().cloned();
                self.replace_collection(c, current, ctx)
                    .map(|c| PropertyValue::Collection(Some(c)))
            }
            (_, PropertyValue::Component(None)) => Ok(PropertyValue::Component(None)),
            (PropertyKind::Component { properties }, PropertyValue::Component(Some(values))) => {
                let existing_values = existing
                    .as_component()
                    .map(<[PropertyValue]>::to_vec)
                    .unwrap_or_default();
                let nested = self.replace_values(properties, values, &existing_values, None, ctx)?;
                Ok(PropertyValue::Component(Some(nested)))
            }
            (_, PropertyValue::Component(Some(values))) => {
                Ok(PropertyValue::Component(Some(values.clone())))
            }
        }
    }

    /// The managed instance a merged reference should point at.
    fn resolve_merged_reference(
        &mut self,
        reference: &EntityHandle,
        ctx: &CascadeContext,
    ) -> Result<EntityHandle> {
        if let Some(copy) = ctx.copy_cache.get(reference) {
            return Ok(copy);
        }
        if reference.is_uninitialized() {
            self.pc.reassociate_proxy(reference);
            return Ok(reference.clone());
        }
        let target = self.pc.unproxy(reference)?;
        if self.pc.is_entry_for(&target) {
            return Ok(reference.clone());
        }
        let id = target.id();
        if id.is_null() {
            return Ok(reference.clone());
        }
        let key = EntityKey::for_entity(&target.metadata(), id.clone());
        if let Some(managed) = self.pc.get_entity(&key) {
            return self.pc.proxy_for(&key, &managed);
        }
        self.internal_load(&target.entity_name(), &id)
    }

    fn replace_collection(
        &mut self,
        original: &CollectionHandle,
        existing: Option<CollectionHandle>,
        ctx: &mut CascadeContext,
    ) -> Result<CollectionHandle> {
        if !original.is_initialized() {
            return Ok(existing.unwrap_or_else(|| original.clone()));
        }
        let mut elements = Vec::new();
        for element in original.loaded_elements() {
            elements.push(match element {
                Element::Entity(e) => Element::Entity(self.resolve_merged_reference(&e, ctx)?),
                value => value,
            });
        }
        let target = match existing {
            Some(existing) => existing,
            None => return Ok(CollectionHandle::with_elements(original.role(), elements)),
        };
        if !target.is_initialized() {
            self.initialize_collection(&target)?;
        }
        if !same_elements(&target.loaded_elements(), &elements) {
            target.replace_elements(elements);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Status;
    use crate::testing::{account, fixture, persist_committed, player, team};
    use orm_core::Value;

    #[test]
    fn test_merge_transient_creates_managed_copy() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let a = account(&fx, "ada");
        let copy = session.merge(&a).unwrap();
        assert!(!copy.ptr_eq(&a));
        assert!(!session.contains(&a));
        assert_eq!(session.entry_status(&copy), Some(Status::Saving));
        assert_eq!(copy.value("owner").unwrap(), Value::from("ada"));
    }

    #[test]
    fn test_merge_detached_copies_onto_loaded_instance() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        a.set("owner", Value::from("bob")).unwrap();

        let mut session = fx.factory.open_session();
        let managed = session.merge(&a).unwrap();
        assert!(!managed.ptr_eq(&a));
        assert_eq!(managed.value("owner").unwrap(), Value::from("bob"));
        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 1);
    }

    #[test]
    fn test_merge_stale_version_fails() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.db.set_version("Account", &a.id(), Value::BigInt(4));
        fx.factory.evict_entity_region("Account").unwrap();

        let mut session = fx.factory.open_session();
        let err = session.merge(&a).unwrap_err();
        assert!(err.is_optimistic_failure());
    }

    #[test]
    fn test_merge_persistent_returns_itself() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let t = team(&fx, 1, "Reds");
        session.save(&t).unwrap();
        assert!(session.merge(&t).unwrap().ptr_eq(&t));
    }

    #[test]
    fn test_merge_deleted_instance_fails() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        session.delete(&loaded).unwrap();
        let err = session.merge(&loaded).unwrap_err();
        assert!(matches!(err, Error::ObjectDeleted(_)));
    }

    #[test]
    fn test_merge_cascades_through_collection() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        let p = player(&fx, 10, "Ann");
        t.collection("players")
            .unwrap()
            .unwrap()
            .add(Element::Entity(p.clone()))
            .unwrap();

        let mut session = fx.factory.open_session();
        let mut cache = CopyCache::new();
        let copy = session.merge_with_copy_cache(&t, &mut cache).unwrap();
        assert_eq!(cache.len(), 2);
        let players = copy.collection("players").unwrap().unwrap();
        let element = players.elements().unwrap();
        let merged_player = element[0].as_entity().unwrap();
        assert!(merged_player.ptr_eq(&cache.get(&p).unwrap()));
        assert!(!merged_player.ptr_eq(&p));
    }
}
