//! Load: resolve an identifier through the persistence context, the
//! second-level cache and finally the database.

use crate::Session;
use crate::entry::Status;
use crate::key::{CollectionKey, EntityKey};
use orm_core::{
    CacheEntry, CacheKey, CacheMode, CollectionHandle, EntityErrorInfo, EntityHandle,
    EntityPersister, Error, LockMode, PropertyKind, PropertyMetadata, PropertyValue, Result,
    Value,
};
use std::sync::Arc;

impl Session {
    /// Return the persistent instance of `entity_name` with `id`, or `None`
    /// when no such row exists.
    ///
    /// Never returns an uninitialized proxy. An instance already in the
    /// session is returned without touching the database.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<EntityHandle>> {
        self.get_with_lock(entity_name, id, LockMode::None)
    }

    /// Like [`Session::get`], obtaining `mode` on the instance.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get_with_lock(
        &mut self,
        entity_name: &str,
        id: impl Into<Value>,
        mode: LockMode,
    ) -> Result<Option<EntityHandle>> {
        self.check_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::Usage("id to load is required for loading".to_string()));
        }
        if mode == LockMode::Write {
            return Err(Error::Usage("invalid lock mode for get(): WRITE".to_string()));
        }
        self.get_internal(entity_name, &id, mode)
    }

    /// Return a reference to the instance with `id`, assuming it exists.
    ///
    /// Lazy entities come back as uninitialized proxies and touch the
    /// database only when initialized. Eager entities are loaded at once and
    /// a missing row fails with `ObjectNotFound`.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn load(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityHandle> {
        self.check_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::Usage("id to load is required for loading".to_string()));
        }
        self.internal_load(entity_name, &id)
    }

    /// Load the row behind an uninitialized proxy and return the real
    /// instance. Other instances are returned unchanged.
    pub fn initialize_proxy(&mut self, proxy: &EntityHandle) -> Result<EntityHandle> {
        self.check_open()?;
        if !proxy.is_uninitialized() {
            return self.pc.unproxy(proxy);
        }
        let name = proxy.entity_name();
        let id = proxy.id();
        tracing::debug!(entity = %name, id = %id, "Initializing proxy");
        self.pc.reassociate_proxy(proxy);
        let Some(found) = self.get_internal(&name, &id, LockMode::None)? else {
            return Err(Error::not_found(&name, &id));
        };
        let target = self.pc.unproxy(&found)?;
        if proxy.is_uninitialized() {
            proxy.set_proxy_target(&target)?;
        }
        Ok(target)
    }

    /// Resolve an association target: a proxy for lazy entities, the loaded
    /// instance otherwise.
    pub(crate) fn internal_load(&mut self, entity_name: &str, id: &Value) -> Result<EntityHandle> {
        let persister = self.factory.entity_persister(entity_name)?;
        let key = EntityKey::for_entity(persister.metadata(), id.clone());
        if let Some(existing) = self.pc.get_entity(&key) {
            return self.pc.proxy_for(&key, &existing);
        }
        if let Some(proxy) = self.pc.get_proxy(&key) {
            return Ok(proxy);
        }
        if persister.metadata().lazy {
            let proxy = EntityHandle::new_proxy(persister.metadata(), id.clone());
            if self.pc.is_default_read_only() {
                proxy.set_proxy_read_only(true);
            }
            tracing::trace!(key = %key, "Created proxy");
            self.pc.add_proxy(key, &proxy);
            return Ok(proxy);
        }
        self.get_internal(entity_name, id, LockMode::None)?
            .ok_or_else(|| Error::not_found(entity_name, id))
    }

    /// The full lookup chain behind `get`.
    pub(crate) fn get_internal(
        &mut self,
        entity_name: &str,
        id: &Value,
        mode: LockMode,
    ) -> Result<Option<EntityHandle>> {
        let persister = self.factory.entity_persister(entity_name)?;
        let key = EntityKey::for_entity(persister.metadata(), id.clone());

        if let Some(existing) = self.pc.get_entity(&key) {
            if self
                .pc
                .get_entry(&existing)
                .is_some_and(|e| e.status().is_deleted_or_gone())
            {
                tracing::trace!(key = %key, "Instance was deleted in this session");
                return Ok(None);
            }
            if !existing.metadata().is_instance_of(entity_name) {
                return Err(wrong_class(entity_name, id));
            }
            tracing::trace!(key = %key, "Resolved in persistence context");
            if mode != LockMode::None {
                self.upgrade_lock(&existing, mode)?;
            }
            return self.pc.proxy_for(&key, &existing).map(Some);
        }

        if mode == LockMode::None {
            if let Some(entity) = self.load_from_cache(&persister, &key)? {
                return self.pc.proxy_for(&key, &entity).map(Some);
            }
        }
        match self.load_from_datasource(&persister, &key, mode)? {
            Some(entity) => self.pc.proxy_for(&key, &entity).map(Some),
            None => Ok(None),
        }
    }

    fn load_from_cache(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        key: &EntityKey,
    ) -> Result<Option<EntityHandle>> {
        if !self.config.cache_mode.is_get_enabled() {
            return Ok(None);
        }
        let Some(cache) = self.factory.entity_cache(persister.as_ref()) else {
            return Ok(None);
        };
        let cache_key = CacheKey::entity(persister.metadata().root_name(), key.id().clone());
        let region = cache.region_name().to_string();
        let Some(entry) = cache.get(&cache_key, self.timestamp)? else {
            tracing::trace!(key = %key, region = %region, "Cache miss");
            self.factory.statistics().cache_miss(&region);
            return Ok(None);
        };
        tracing::trace!(key = %key, region = %region, "Cache hit");
        self.factory.statistics().cache_hit(&region);

        let subclass = self.factory.entity_persister(&entry.subclass)?;
        if !subclass.metadata().is_instance_of(persister.entity_name()) {
            return Err(wrong_class(persister.entity_name(), key.id()));
        }
        let entity = subclass.instantiate(key.id());
        self.assemble_row(&entity, &subclass, key.id(), entry.state, entry.version, LockMode::None)?;
        Ok(Some(entity))
    }

    fn load_from_datasource(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        key: &EntityKey,
        mode: LockMode,
    ) -> Result<Option<EntityHandle>> {
        // Optimistic and forced modes are applied once the row is in hand.
        let deferred = mode.forces_version_increment() || mode == LockMode::Optimistic;
        let row_lock = if deferred || mode == LockMode::None {
            LockMode::Read
        } else {
            mode
        };
        let Some(row) = persister.load(key.id(), row_lock)? else {
            tracing::debug!(key = %key, "No row found");
            return Ok(None);
        };
        self.factory.statistics().entity_fetched();

        let subclass = if row.entity_name == persister.entity_name() {
            Arc::clone(persister)
        } else {
            self.factory.entity_persister(&row.entity_name)?
        };
        if !subclass.metadata().is_instance_of(persister.entity_name()) {
            return Err(wrong_class(persister.entity_name(), key.id()));
        }
        let entity = subclass.instantiate(key.id());
        let state = self.assemble_row(
            &entity,
            &subclass,
            key.id(),
            row.state,
            row.version.clone(),
            row_lock,
        )?;
        self.put_loaded_in_cache(&subclass, key.id(), state, row.version)?;
        if deferred {
            self.upgrade_lock(&entity, mode)?;
        }
        Ok(Some(entity))
    }

    pub(crate) fn put_loaded_in_cache(
        &self,
        persister: &Arc<dyn EntityPersister>,
        id: &Value,
        state: Vec<Value>,
        version: Value,
    ) -> Result<()> {
        let mode = self.config.cache_mode;
        if !mode.is_put_enabled() {
            return Ok(());
        }
        let Some(cache) = self.factory.entity_cache(persister.as_ref()) else {
            return Ok(());
        };
        let minimal_put = self.factory.options().minimal_puts && mode != CacheMode::Refresh;
        let entry = CacheEntry {
            subclass: persister.entity_name().to_string(),
            state,
            version: version.clone(),
        };
        let key = CacheKey::entity(persister.metadata().root_name(), id.clone());
        if cache.put_from_load(&key, &entry, self.timestamp, &version, minimal_put)? {
            tracing::trace!(key = %key, "Cached loaded state");
            self.factory.statistics().cache_put(cache.region_name());
        }
        Ok(())
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Populate `entity` from a disassembled row and register it.
    ///
    /// The entry is added before references are resolved so circular
    /// associations come back to this instance. Returns the state after the
    /// interceptor had its say, ready for caching.
    pub(crate) fn assemble_row(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        id: &Value,
        mut state: Vec<Value>,
        version: Value,
        lock_mode: LockMode,
    ) -> Result<Vec<Value>> {
        let metadata = Arc::clone(persister.metadata());
        let key = EntityKey::for_entity(&metadata, id.clone());
        let read_only = !metadata.mutable
            || self
                .pc
                .get_proxy(&key)
                .and_then(|p| p.proxy_read_only())
                .unwrap_or_else(|| self.pc.is_default_read_only());
        let status = if read_only {
            Status::ReadOnly
        } else {
            Status::Managed
        };
        self.pc.add_entity_with_entry(
            entity,
            key,
            status,
            None,
            version.clone(),
            lock_mode,
            true,
            Arc::clone(persister),
            false,
        );

        self.callbacks.fire_pre_load(entity)?;
        let names = metadata.property_names();
        let kinds: Vec<PropertyKind> = metadata.properties.iter().map(|p| p.kind.clone()).collect();
        if self
            .factory
            .interceptor()
            .on_load(entity, id, &mut state, &names, &kinds)?
        {
            tracing::trace!(entity = %metadata.name, id = %id, "Interceptor rewrote loaded state");
        }

        let values = self.resolve_state(entity, id, &metadata.properties, &state)?;
        persister.set_property_values(entity, values.clone())?;
        entity.set_version(version);
        entity.clear_modified();
        if let Some(entry) = self.pc.get_entry_mut(entity) {
            entry.set_loaded_state(if read_only { None } else { Some(values) });
        }
        self.factory.statistics().entity_loaded();
        tracing::debug!(entity = %metadata.name, id = %id, "Loaded instance");
        Ok(state)
    }

    fn resolve_state(
        &mut self,
        owner: &EntityHandle,
        owner_id: &Value,
        properties: &[PropertyMetadata],
        state: &[Value],
    ) -> Result<Vec<PropertyValue>> {
        let mut values = Vec::with_capacity(properties.len());
        for (property, value) in properties.iter().zip(state) {
            values.push(self.resolve_value(owner, owner_id, &property.kind, value)?);
        }
        Ok(values)
    }

    fn resolve_value(
        &mut self,
        owner: &EntityHandle,
        owner_id: &Value,
        kind: &PropertyKind,
        value: &Value,
    ) -> Result<PropertyValue> {
        Ok(match kind {
            PropertyKind::Basic => PropertyValue::Value(value.clone()),
            PropertyKind::ManyToOne { target } | PropertyKind::OneToOne { target } => {
                if value.is_null() {
                    PropertyValue::Entity(None)
                } else {
                    PropertyValue::Entity(Some(self.internal_load(target, value)?))
                }
            }
            PropertyKind::Collection { role } => {
                PropertyValue::Collection(Some(self.collection_wrapper(owner, role, owner_id)))
            }
            PropertyKind::Component { properties } => match value {
                Value::Array(nested) => PropertyValue::Component(Some(self.resolve_state(
                    owner, owner_id, properties, nested,
                )?)),
                _ => PropertyValue::Component(None),
            },
        })
    }

    /// The session's wrapper for the collection `role` owned by `key`,
    /// registering an uninitialized one when none exists.
    fn collection_wrapper(&mut self, owner: &EntityHandle, role: &str, key: &Value) -> CollectionHandle {
        if let Some(existing) = self.pc.get_collection(&CollectionKey::new(role, key.clone())) {
            if let Some(entry) = self.pc.get_collection_entry_mut(&existing) {
                entry.set_owner(owner);
            }
            return existing;
        }
        let collection = CollectionHandle::uninitialized(role, key.clone());
        self.pc
            .add_uninitialized_collection(&collection, Some(owner), role, key.clone());
        collection
    }
}

fn wrong_class(entity_name: &str, id: &Value) -> Error {
    Error::WrongClass(EntityErrorInfo::new(
        entity_name,
        Some(id.clone()),
        "object with the specified identifier is not of the requested type",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionFactoryOptions;
    use crate::testing::{account, fixture, fixture_with, persist_committed, player, team};
    use orm_core::{Element, RegionAccessStrategy};
    use std::sync::Mutex;

    #[test]
    fn test_get_returns_same_instance() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.accounts.evict_all().unwrap();
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        let first = session.get("Account", a.id()).unwrap().unwrap();
        let second = session.get("Account", a.id()).unwrap().unwrap();
        assert!(first.ptr_eq(&second));
        assert!(!first.ptr_eq(&a));
        assert_eq!(first.value("owner").unwrap(), Value::from("ada"));
        assert_eq!(fx.db.count("select"), 1);
        assert_eq!(session.get_current_lock_mode(&first).unwrap(), LockMode::Read);
    }

    #[test]
    fn test_get_missing_row() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        assert!(session.get("Team", 42).unwrap().is_none());
        assert!(session.get("Team", Value::Null).unwrap_err().is_usage_error());
    }

    #[test]
    fn test_get_of_deleted_instance_is_none() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Team", 1).unwrap().unwrap();
        session.delete(&loaded).unwrap();
        assert!(session.get("Team", 1).unwrap().is_none());
    }

    #[test]
    fn test_second_session_reads_from_cache() {
        let fx = fixture_with(SessionFactoryOptions {
            statistics_enabled: true,
            ..SessionFactoryOptions::default()
        });
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut warm = fx.factory.open_session();
        warm.get("Account", a.id()).unwrap().unwrap();
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        let cached = session.get("Account", a.id()).unwrap().unwrap();
        assert_eq!(cached.value("owner").unwrap(), Value::from("ada"));
        assert_eq!(fx.db.count("select"), 0);
        assert_eq!(session.get_current_lock_mode(&cached).unwrap(), LockMode::None);
        let stats = fx.factory.statistics().snapshot();
        assert!(stats.regions["accounts"].hits >= 1);
    }

    #[test]
    fn test_ignore_cache_mode_skips_cache() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut warm = fx.factory.open_session();
        warm.get("Account", a.id()).unwrap().unwrap();
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        session.set_cache_mode(CacheMode::Ignore);
        session.get("Account", a.id()).unwrap().unwrap();
        assert_eq!(fx.db.count("select"), 1);
    }

    #[test]
    fn test_load_of_lazy_entity_is_a_proxy() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        let proxy = session.load("Team", 1).unwrap();
        assert!(proxy.is_uninitialized());
        assert_eq!(fx.db.count("select"), 0);

        let target = session.initialize_proxy(&proxy).unwrap();
        assert!(!proxy.is_uninitialized());
        assert_eq!(target.value("name").unwrap(), Value::from("Reds"));
        assert_eq!(fx.db.count("select"), 1);

        let again = session.get("Team", 1).unwrap().unwrap();
        assert!(again.ptr_eq(&proxy));
    }

    #[test]
    fn test_proxy_of_missing_row_fails_on_initialize() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let proxy = session.load("Team", 9).unwrap();
        let err = session.initialize_proxy(&proxy).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn test_load_of_eager_entity_fails_when_missing() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let err = session.load("Account", 9).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn test_associations_resolve_lazily() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        let p = player(&fx, 10, "Ann");
        p.set("team", &t).unwrap();
        t.collection("players")
            .unwrap()
            .unwrap()
            .add(Element::Entity(p.clone()))
            .unwrap();
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Player", 10).unwrap().unwrap();
        let team_ref = loaded.entity("team").unwrap().unwrap();
        assert!(team_ref.is_uninitialized());

        let players = session
            .initialize_proxy(&team_ref)
            .unwrap()
            .collection("players")
            .unwrap()
            .unwrap();
        assert!(!players.is_initialized());
        session.initialize_collection(&players).unwrap();
        assert!(players.loaded_elements()[0].as_entity().unwrap().ptr_eq(&loaded));
    }

    #[test]
    fn test_default_read_only_loads() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        session.set_default_read_only(true);
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        assert!(session.is_read_only(&loaded).unwrap());
        assert!(session.entry_status(&loaded) == Some(Status::ReadOnly));
    }

    #[test]
    fn test_pre_load_callback_sees_instance() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.on_pre_load(move |e| {
            sink.lock().unwrap().push(e.entity_name());
            Ok(())
        });
        session.get("Team", 1).unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["Team".to_string()]);
    }

    #[test]
    fn test_get_with_pessimistic_lock() {
        let fx = fixture_with(SessionFactoryOptions {
            use_second_level_cache: false,
            ..SessionFactoryOptions::default()
        });
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        let loaded = session
            .get_with_lock("Account", a.id(), LockMode::PessimisticWrite)
            .unwrap()
            .unwrap();
        assert_eq!(
            session.get_current_lock_mode(&loaded).unwrap(),
            LockMode::PessimisticWrite
        );
        assert_eq!(fx.db.count("lock"), 1);
    }
}
