//! Refresh: overwrite an instance with the current database state.

use crate::Session;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::key::EntityKey;
use orm_core::{
    CacheKey, EntityErrorInfo, EntityHandle, EntityPersister, Error, LockMode, PropertyKind,
    Result, Value,
};
use std::sync::Arc;

impl Session {
    /// Re-read the state of an instance from the database, discarding
    /// unflushed changes. Cached copies of the row and its collections are
    /// evicted first.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn refresh(&mut self, entity: &EntityHandle) -> Result<()> {
        self.refresh_with_lock(entity, LockMode::None)
    }

    /// Like [`Session::refresh`], obtaining `mode` on the re-read row.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn refresh_with_lock(&mut self, entity: &EntityHandle, mode: LockMode) -> Result<()> {
        self.check_open()?;
        if mode == LockMode::Write {
            return Err(Error::Usage("invalid lock mode for refresh(): WRITE".to_string()));
        }
        self.refresh_internal(entity, mode, &mut CascadeContext::new())
    }

    pub(crate) fn refresh_internal(
        &mut self,
        entity: &EntityHandle,
        mode: LockMode,
        ctx: &mut CascadeContext,
    ) -> Result<()> {
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            tracing::trace!("Refresh of an uninitialized proxy is deferred to its initialization");
            return Ok(());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        if !ctx.visit(&entity) {
            return Ok(());
        }

        let entry = self.pc.get_entry(&entity).cloned();
        let (persister, id) = match &entry {
            Some(entry) => {
                if entry.status().is_deleted_or_gone() {
                    return Err(Error::object_deleted(
                        entry.entity_name(),
                        entry.id(),
                        "attempted to refresh a deleted instance",
                    ));
                }
                (Arc::clone(entry.persister()), entry.id().clone())
            }
            None => {
                let persister = self.persister_for(&entity)?;
                let id = persister.get_identifier(&entity);
                if id.is_null() {
                    return Err(Error::TransientObject(format!(
                        "transient instance passed to refresh: {}",
                        persister.entity_name()
                    )));
                }
                let key = EntityKey::for_entity(persister.metadata(), id.clone());
                if self.pc.get_entity(&key).is_some_and(|other| !other.ptr_eq(&entity)) {
                    return Err(Error::NonUniqueObject(EntityErrorInfo::new(
                        persister.entity_name(),
                        Some(id),
                        "refreshed object is already associated with the session",
                    )));
                }
                (persister, id)
            }
        };
        tracing::debug!(entity = %persister.entity_name(), id = %id, "Refreshing instance");

        self.cascade(
            CascadingAction::Refresh,
            CascadePoint::BeforeRefresh,
            &persister,
            &entity,
            ctx,
        )?;

        let key = EntityKey::for_entity(persister.metadata(), id.clone());
        if entry.is_some() {
            self.pc.remove_entry(&entity);
            self.pc.remove_entity(&key);
            self.evict_collections(&entity, &persister)?;
        }
        self.evict_cached(&persister, &id)?;

        let deferred = mode.forces_version_increment() || mode == LockMode::Optimistic;
        let row_lock = if deferred || mode == LockMode::None {
            LockMode::Read
        } else {
            mode
        };
        let Some(row) = persister.load(&id, row_lock)? else {
            return Err(Error::not_found(persister.entity_name(), &id));
        };
        self.factory.statistics().entity_fetched();
        if row.entity_name != persister.entity_name() {
            return Err(Error::WrongClass(EntityErrorInfo::new(
                persister.entity_name(),
                Some(id),
                "refreshed row belongs to a different class",
            )));
        }

        let state = self.assemble_row(&entity, &persister, &id, row.state, row.version.clone(), row_lock)?;
        self.put_loaded_in_cache(&persister, &id, state, row.version)?;
        if let Some(previous) = &entry {
            if previous.is_read_only() != self.pc.is_read_only(&entity)? {
                self.pc.set_read_only(&entity, previous.is_read_only())?;
            }
        }
        if deferred {
            self.upgrade_lock(&entity, mode)?;
        }
        Ok(())
    }

    /// Drop second-level cache copies of a row and of its collections.
    fn evict_cached(&self, persister: &Arc<dyn EntityPersister>, id: &Value) -> Result<()> {
        if let Some(cache) = self.factory.entity_cache(persister.as_ref()) {
            cache.evict(&CacheKey::entity(persister.metadata().root_name(), id.clone()))?;
        }
        for property in &persister.metadata().properties {
            let PropertyKind::Collection { role } = &property.kind else {
                continue;
            };
            let collection_persister = self.factory.collection_persister(role)?;
            if let Some(cache) = self.factory.collection_cache(collection_persister.as_ref()) {
                cache.evict(&CacheKey::collection(role.as_str(), id.clone()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, fixture, persist_committed, team};
    use orm_core::RegionAccessStrategy;

    #[test]
    fn test_refresh_discards_local_changes() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        loaded.set("owner", Value::from("bob")).unwrap();
        session.refresh(&loaded).unwrap();
        assert_eq!(loaded.value("owner").unwrap(), Value::from("ada"));
        assert!(session.contains(&loaded));

        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 0);
    }

    #[test]
    fn test_refresh_sees_concurrent_version() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        fx.db.set_version("Account", &a.id(), Value::BigInt(4));
        session.refresh(&loaded).unwrap();
        assert_eq!(loaded.version(), Value::BigInt(4));
        assert_eq!(session.get_current_lock_mode(&loaded).unwrap(), LockMode::Read);
    }

    #[test]
    fn test_refresh_evicts_cached_copy() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        fx.db.set_version("Account", &a.id(), Value::BigInt(4));
        session.refresh(&loaded).unwrap();

        let key = CacheKey::entity("Account", a.id());
        let cached = fx.accounts.get(&key, u64::MAX).unwrap();
        assert!(cached.is_none_or(|entry| entry.version == Value::BigInt(4)));
    }

    #[test]
    fn test_refresh_detached_instance_reattaches() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);
        t.set("name", Value::from("Blues")).unwrap();

        let mut session = fx.factory.open_session();
        session.refresh(&t).unwrap();
        assert!(session.contains(&t));
        assert_eq!(t.value("name").unwrap(), Value::from("Reds"));
    }

    #[test]
    fn test_refresh_of_removed_row_fails() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);

        let mut other = fx.factory.open_session();
        let doomed = other.get("Team", 1).unwrap().unwrap();
        other.delete(&doomed).unwrap();
        other.commit().unwrap();

        let mut session = fx.factory.open_session();
        let err = session.refresh(&t).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn test_refresh_transient_fails() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let err = session.refresh(&account(&fx, "ada")).unwrap_err();
        assert!(matches!(err, Error::TransientObject(_)));
    }
}
