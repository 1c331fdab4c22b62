//! Lazy collection initialization.

use crate::Session;
use orm_core::{
    CacheEntry, CacheKey, CacheMode, CollectionHandle, CollectionPersister, Element, ElementKind,
    Error, Result, Value,
};
use std::sync::Arc;

impl Session {
    /// Load the elements of an uninitialized collection, from the
    /// second-level cache when it holds them.
    #[tracing::instrument(level = "debug", skip(self, collection), fields(role = %collection.role()))]
    pub fn initialize_collection(&mut self, collection: &CollectionHandle) -> Result<()> {
        self.check_open()?;
        if collection.is_initialized() {
            return Ok(());
        }
        let Some(entry) = self.pc.get_collection_entry(collection) else {
            return Err(Error::Usage(format!(
                "collection was evicted: {}",
                collection.role()
            )));
        };
        let (Some(role), Some(key)) = (entry.loaded_role(), entry.loaded_key()) else {
            return Err(Error::AssertionFailure(format!(
                "uninitialized collection has no loaded key: {}",
                collection.role()
            )));
        };
        let role = role.to_string();
        let key = key.clone();
        let persister = self.factory.collection_persister(&role)?;

        if self.initialize_collection_from_cache(collection, &persister, &key)? {
            tracing::trace!(role = %role, key = %key, "Collection initialized from cache");
            return Ok(());
        }

        let rows = persister.load(&key)?;
        self.factory.statistics().collection_fetched();
        let elements = self.assemble_elements(persister.as_ref(), &rows)?;
        self.install_elements(collection, elements);
        self.put_collection_in_cache(&persister, &key, rows)?;
        tracing::debug!(role = %role, key = %key, "Collection initialized");
        Ok(())
    }

    fn initialize_collection_from_cache(
        &mut self,
        collection: &CollectionHandle,
        persister: &Arc<dyn CollectionPersister>,
        key: &Value,
    ) -> Result<bool> {
        if self.has_enabled_filters(persister.as_ref()) || !self.config.cache_mode.is_get_enabled() {
            return Ok(false);
        }
        let Some(cache) = self.factory.collection_cache(persister.as_ref()) else {
            return Ok(false);
        };
        let cache_key = CacheKey::collection(persister.role(), key.clone());
        let Some(entry) = cache.get(&cache_key, self.timestamp)? else {
            self.factory.statistics().cache_miss(cache.region_name());
            return Ok(false);
        };
        self.factory.statistics().cache_hit(cache.region_name());
        let elements = self.assemble_elements(persister.as_ref(), &entry.state)?;
        self.install_elements(collection, elements);
        Ok(true)
    }

    fn install_elements(&mut self, collection: &CollectionHandle, elements: Vec<Element>) {
        collection.inject_loaded(elements);
        let flushing = self.pc.is_flushing();
        if let Some(entry) = self.pc.get_collection_entry_mut(collection) {
            entry.post_initialize(collection);
            if flushing {
                entry.set_ignore();
            }
        }
        self.factory.statistics().collection_loaded();
    }

    fn put_collection_in_cache(
        &self,
        persister: &Arc<dyn CollectionPersister>,
        key: &Value,
        rows: Vec<Value>,
    ) -> Result<()> {
        let mode = self.config.cache_mode;
        if !mode.is_put_enabled() || self.has_enabled_filters(persister.as_ref()) {
            return Ok(());
        }
        let Some(cache) = self.factory.collection_cache(persister.as_ref()) else {
            return Ok(());
        };
        let entry = CacheEntry {
            subclass: persister.role().to_string(),
            state: rows,
            version: Value::Null,
        };
        let minimal_put = self.factory.options().minimal_puts && mode != CacheMode::Refresh;
        let cache_key = CacheKey::collection(persister.role(), key.clone());
        if cache.put_from_load(&cache_key, &entry, self.timestamp, &Value::Null, minimal_put)? {
            self.factory.statistics().cache_put(cache.region_name());
        }
        Ok(())
    }

    /// Is a filter on this role enabled? Filtered contents never touch the cache.
    fn has_enabled_filters(&self, persister: &dyn CollectionPersister) -> bool {
        persister
            .metadata()
            .filters
            .iter()
            .any(|f| self.enabled_filters.contains(f))
    }

    fn assemble_elements(
        &mut self,
        persister: &dyn CollectionPersister,
        rows: &[Value],
    ) -> Result<Vec<Element>> {
        let mut elements = Vec::with_capacity(rows.len());
        match &persister.metadata().element {
            ElementKind::Value => elements.extend(rows.iter().cloned().map(Element::Value)),
            ElementKind::Entity { target } => {
                for id in rows.iter().filter(|id| !id.is_null()) {
                    elements.push(Element::Entity(self.internal_load(target, id)?));
                }
            }
        }
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{fixture, persist_committed, player, team};
    use orm_core::{Element, Error};

    fn committed_team_with_players(fx: &crate::testing::Fixture) {
        let t = team(fx, 1, "Reds");
        let players = t.collection("players").unwrap().unwrap();
        players.add(Element::Entity(player(fx, 10, "Ann"))).unwrap();
        players.add(Element::Entity(player(fx, 11, "Bo"))).unwrap();
        persist_committed(fx, &t);
    }

    #[test]
    fn test_initialize_loads_elements_once() {
        let fx = fixture();
        committed_team_with_players(&fx);

        let mut session = fx.factory.open_session();
        let t = session.get("Team", 1).unwrap().unwrap();
        let players = t.collection("players").unwrap().unwrap();
        assert!(!players.is_initialized());
        fx.db.clear_log();

        session.initialize_collection(&players).unwrap();
        session.initialize_collection(&players).unwrap();
        assert_eq!(players.len().unwrap(), 2);
        assert!(!players.is_dirty());
        assert_eq!(fx.db.count("collection-select"), 1);
        let snapshot = session
            .persistence_context()
            .get_collection_entry(&players)
            .unwrap()
            .snapshot()
            .unwrap()
            .len();
        assert_eq!(snapshot, 2);
    }

    #[test]
    fn test_evicted_collection_cannot_initialize() {
        let fx = fixture();
        committed_team_with_players(&fx);

        let mut session = fx.factory.open_session();
        let t = session.get("Team", 1).unwrap().unwrap();
        let players = t.collection("players").unwrap().unwrap();
        session.evict(&t).unwrap();
        let err = session.initialize_collection(&players).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_second_session_reads_roster_from_cache() {
        let fx = fixture();
        committed_team_with_players(&fx);

        let mut first = fx.factory.open_session();
        let t = first.get("Team", 1).unwrap().unwrap();
        first
            .initialize_collection(&t.collection("players").unwrap().unwrap())
            .unwrap();
        first.close().unwrap();
        fx.db.clear_log();

        let mut second = fx.factory.open_session();
        let t = second.get("Team", 1).unwrap().unwrap();
        let players = t.collection("players").unwrap().unwrap();
        second.initialize_collection(&players).unwrap();
        assert_eq!(players.len().unwrap(), 2);
        assert_eq!(fx.db.count("collection-select"), 0);
        assert!(players
            .loaded_elements()
            .iter()
            .all(|e| e.as_entity().is_some_and(|p| !p.id().is_null())));
    }
}
