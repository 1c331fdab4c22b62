//! The persistence context: identity map, entries, proxies and collections.

use crate::collection_entry::CollectionEntry;
use crate::entry::{EntityEntry, Status};
use crate::key::{CollectionKey, EntityKey};
use orm_core::{
    CollectionHandle, Element, EntityHandle, EntityPersister, Error, LockMode, Result, Value,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

struct EntityRecord {
    entity: EntityHandle,
    entry: EntityEntry,
    seq: u64,
}

struct CollectionRecord {
    collection: CollectionHandle,
    entry: CollectionEntry,
    seq: u64,
}

/// Session-scoped cache of managed instances.
///
/// Guarantees at most one managed instance per [`EntityKey`], keeps one
/// [`EntityEntry`] per managed instance (keyed by instance identity) and one
/// [`CollectionEntry`] per attached collection. Iteration follows
/// registration order.
pub struct PersistenceContext {
    entities_by_key: HashMap<EntityKey, EntityHandle>,
    entries: HashMap<usize, EntityRecord>,
    proxies_by_key: HashMap<EntityKey, EntityHandle>,
    snapshots_by_key: HashMap<EntityKey, Option<Vec<Value>>>,
    collections: HashMap<usize, CollectionRecord>,
    collections_by_key: HashMap<CollectionKey, CollectionHandle>,
    nullifiable_keys: HashSet<EntityKey>,
    inserted_keys: HashMap<String, Vec<Value>>,
    cascade_level: usize,
    flushing: bool,
    default_read_only: bool,
    has_non_read_only_entities: bool,
    next_seq: u64,
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PersistenceContext {
    /// Create an empty context.
    pub fn new(default_read_only: bool) -> Self {
        Self {
            entities_by_key: HashMap::new(),
            entries: HashMap::new(),
            proxies_by_key: HashMap::new(),
            snapshots_by_key: HashMap::new(),
            collections: HashMap::new(),
            collections_by_key: HashMap::new(),
            nullifiable_keys: HashSet::new(),
            inserted_keys: HashMap::new(),
            cascade_level: 0,
            flushing: false,
            default_read_only,
            has_non_read_only_entities: false,
            next_seq: 0,
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entities_by_key.clear();
        self.entries.clear();
        self.proxies_by_key.clear();
        self.snapshots_by_key.clear();
        self.collections.clear();
        self.collections_by_key.clear();
        self.nullifiable_keys.clear();
        self.cascade_level = 0;
        self.flushing = false;
        self.has_non_read_only_entities = false;
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    // ========================================================================
    // Identity map
    // ========================================================================

    /// Register `entity` under `key`.
    pub fn add_entity(&mut self, key: EntityKey, entity: &EntityHandle) {
        self.entities_by_key.insert(key, entity.clone());
    }

    /// Managed instance for `key`.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.entities_by_key.get(key).cloned()
    }

    /// Is an instance registered under `key`?
    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities_by_key.contains_key(key)
    }

    /// Unregister the instance under `key`, along with its database snapshot.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityHandle> {
        self.snapshots_by_key.remove(key);
        self.nullifiable_keys.remove(key);
        self.entities_by_key.remove(key)
    }

    /// Fail if a different instance is already registered under `key`.
    pub fn check_uniqueness(&self, key: &EntityKey, entity: &EntityHandle) -> Result<()> {
        match self.entities_by_key.get(key) {
            Some(existing) if !existing.ptr_eq(entity) => {
                Err(Error::non_unique(key.root_name(), key.id()))
            }
            _ => Ok(()),
        }
    }

    /// Number of instances in the identity map.
    pub fn entity_count(&self) -> usize {
        self.entities_by_key.len()
    }

    // ========================================================================
    // Entity entries
    // ========================================================================

    /// Attach `entry` to `entity`.
    pub fn add_entry(&mut self, entity: &EntityHandle, entry: EntityEntry) {
        if entry.status() != Status::ReadOnly {
            self.has_non_read_only_entities = true;
        }
        let seq = self.next_seq();
        self.entries.insert(
            entity.object_id(),
            EntityRecord {
                entity: entity.clone(),
                entry,
                seq,
            },
        );
    }

    /// Build an entry for `entity`, register it under `key` and return the entry.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_entity_with_entry(
        &mut self,
        entity: &EntityHandle,
        key: EntityKey,
        status: Status,
        loaded_state: Option<Vec<orm_core::PropertyValue>>,
        version: Value,
        lock_mode: LockMode,
        exists_in_database: bool,
        persister: Arc<dyn EntityPersister>,
        version_increment_disabled: bool,
    ) -> &EntityEntry {
        let entry = EntityEntry::new(
            status,
            loaded_state,
            key.id().clone(),
            version,
            lock_mode,
            exists_in_database,
            persister,
            version_increment_disabled,
        );
        self.add_entity(key, entity);
        self.add_entry(entity, entry);
        &self.entries[&entity.object_id()].entry
    }

    /// Entry of a managed instance.
    pub fn get_entry(&self, entity: &EntityHandle) -> Option<&EntityEntry> {
        self.entries.get(&entity.object_id()).map(|r| &r.entry)
    }

    pub(crate) fn get_entry_mut(&mut self, entity: &EntityHandle) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity.object_id()).map(|r| &mut r.entry)
    }

    /// Detach the entry of `entity`.
    pub fn remove_entry(&mut self, entity: &EntityHandle) -> Option<EntityEntry> {
        self.entries.remove(&entity.object_id()).map(|r| r.entry)
    }

    /// Does `entity` have an entry?
    pub fn is_entry_for(&self, entity: &EntityHandle) -> bool {
        self.entries.contains_key(&entity.object_id())
    }

    /// Change the status of a managed instance.
    pub(crate) fn set_entry_status(&mut self, entity: &EntityHandle, status: Status) -> Result<()> {
        let entry = self.get_entry_mut(entity).ok_or_else(|| {
            Error::AssertionFailure(format!("no entry for {entity:?}"))
        })?;
        entry.set_status(status)
    }

    /// Managed instances with their entries, in registration order.
    ///
    /// Returns copies, so callers may register further instances while
    /// iterating.
    pub fn entries_snapshot(&self) -> Vec<(EntityHandle, EntityEntry)> {
        let mut records: Vec<&EntityRecord> = self.entries.values().collect();
        records.sort_by_key(|r| r.seq);
        records
            .into_iter()
            .map(|r| (r.entity.clone(), r.entry.clone()))
            .collect()
    }

    /// Managed instances in registration order.
    pub fn managed_entities(&self) -> Vec<EntityHandle> {
        let mut records: Vec<&EntityRecord> = self.entries.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.entity.clone()).collect()
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Is any instance writable?
    pub fn has_non_read_only_entities(&self) -> bool {
        self.has_non_read_only_entities
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Register an uninitialized proxy under `key`.
    pub fn add_proxy(&mut self, key: EntityKey, proxy: &EntityHandle) {
        if proxy.proxy_read_only().is_none() {
            proxy.set_proxy_read_only(self.default_read_only);
        }
        self.proxies_by_key.insert(key, proxy.clone());
    }

    /// Proxy registered under `key`.
    pub fn get_proxy(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.proxies_by_key.get(key).cloned()
    }

    /// Unregister the proxy under `key`.
    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<EntityHandle> {
        self.proxies_by_key.remove(key)
    }

    /// Is this exact proxy registered?
    pub fn contains_proxy(&self, proxy: &EntityHandle) -> bool {
        self.proxies_by_key.values().any(|p| p.ptr_eq(proxy))
    }

    fn proxy_key(proxy: &EntityHandle) -> EntityKey {
        EntityKey::for_entity(&proxy.metadata(), proxy.id())
    }

    /// Associate a proxy from elsewhere with this context.
    pub fn reassociate_proxy(&mut self, proxy: &EntityHandle) {
        let key = Self::proxy_key(proxy);
        if !self.proxies_by_key.contains_key(&key) {
            tracing::trace!(key = %key, "Reassociating proxy");
            self.add_proxy(key, proxy);
        }
    }

    /// If `entity` is an uninitialized proxy, reassociate it and report `true`.
    pub fn reassociate_if_uninitialized_proxy(&mut self, entity: &EntityHandle) -> bool {
        if entity.is_uninitialized() {
            self.reassociate_proxy(entity);
            true
        } else {
            false
        }
    }

    /// Connect a registered proxy to its implementation and return the proxy.
    pub fn narrow_proxy(&mut self, proxy: &EntityHandle, implementation: &EntityHandle) -> Result<EntityHandle> {
        if proxy.is_uninitialized() {
            proxy.set_proxy_target(implementation)?;
        }
        Ok(proxy.clone())
    }

    /// The proxy registered for `key`, narrowed to `implementation`, or the
    /// implementation itself when no proxy exists.
    pub fn proxy_for(&mut self, key: &EntityKey, implementation: &EntityHandle) -> Result<EntityHandle> {
        match self.proxies_by_key.get(key).cloned() {
            Some(proxy) => self.narrow_proxy(&proxy, implementation),
            None => Ok(implementation.clone()),
        }
    }

    /// The real instance behind `maybe_proxy`.
    pub fn unproxy(&self, maybe_proxy: &EntityHandle) -> Result<EntityHandle> {
        if !maybe_proxy.is_proxy() {
            return Ok(maybe_proxy.clone());
        }
        maybe_proxy.implementation().ok_or_else(|| {
            Error::LazyInitialization(format!(
                "could not unproxy uninitialized proxy {maybe_proxy:?}"
            ))
        })
    }

    /// Reassociate a proxy with this context and return its real instance
    /// when it is initialized, or the proxy itself otherwise.
    pub fn unproxy_and_reassociate(&mut self, maybe_proxy: &EntityHandle) -> EntityHandle {
        if !maybe_proxy.is_proxy() {
            return maybe_proxy.clone();
        }
        self.reassociate_proxy(maybe_proxy);
        maybe_proxy
            .implementation()
            .unwrap_or_else(|| maybe_proxy.clone())
    }

    // ========================================================================
    // Database snapshots
    // ========================================================================

    /// Cached database state for `key`: `Some(None)` records a missing row.
    pub fn get_cached_database_snapshot(&self, key: &EntityKey) -> Option<Option<Vec<Value>>> {
        self.snapshots_by_key.get(key).cloned()
    }

    /// Database state of the row for `key`, reading it once per context.
    /// `None` means no row exists.
    pub fn get_database_snapshot(
        &mut self,
        key: &EntityKey,
        persister: &dyn EntityPersister,
    ) -> Result<Option<Vec<Value>>> {
        if let Some(cached) = self.snapshots_by_key.get(key) {
            return Ok(cached.clone());
        }
        tracing::trace!(key = %key, "Fetching database snapshot");
        let snapshot = persister.load(key.id(), LockMode::None)?.map(|row| row.state);
        self.snapshots_by_key.insert(key.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Drop every cached database snapshot.
    pub fn clear_snapshots(&mut self) {
        self.snapshots_by_key.clear();
    }

    // ========================================================================
    // Collections
    // ========================================================================

    fn add_collection_record(&mut self, collection: &CollectionHandle, entry: CollectionEntry) {
        let seq = self.next_seq();
        self.collections.insert(
            collection.object_id(),
            CollectionRecord {
                collection: collection.clone(),
                entry,
                seq,
            },
        );
    }

    /// Attach a collection that has no rows yet.
    pub fn add_new_collection(&mut self, collection: &CollectionHandle, owner: &EntityHandle) {
        self.add_collection_record(collection, CollectionEntry::new_unloaded(owner));
    }

    /// Attach a collection whose rows exist under `key`.
    pub fn add_loaded_collection(
        &mut self,
        collection: &CollectionHandle,
        owner: Option<&EntityHandle>,
        role: &str,
        key: Value,
        snapshot: Option<Vec<Element>>,
    ) {
        collection.set_key(key.clone());
        self.collections_by_key
            .insert(CollectionKey::new(role, key.clone()), collection.clone());
        self.add_collection_record(
            collection,
            CollectionEntry::loaded(owner, role, key, snapshot),
        );
    }

    /// Attach an unloaded wrapper for the collection under `key`.
    pub fn add_uninitialized_collection(
        &mut self,
        collection: &CollectionHandle,
        owner: Option<&EntityHandle>,
        role: &str,
        key: Value,
    ) {
        self.add_loaded_collection(collection, owner, role, key, None);
    }

    /// Entry of an attached collection.
    pub fn get_collection_entry(&self, collection: &CollectionHandle) -> Option<&CollectionEntry> {
        self.collections
            .get(&collection.object_id())
            .map(|r| &r.entry)
    }

    pub(crate) fn get_collection_entry_mut(
        &mut self,
        collection: &CollectionHandle,
    ) -> Option<&mut CollectionEntry> {
        self.collections
            .get_mut(&collection.object_id())
            .map(|r| &mut r.entry)
    }

    /// Detach a collection, including its by-key registration.
    pub fn remove_collection_entry(&mut self, collection: &CollectionHandle) -> Option<CollectionEntry> {
        let record = self.collections.remove(&collection.object_id())?;
        if let (Some(role), Some(key)) = (record.entry.loaded_role(), record.entry.loaded_key()) {
            let by_key = CollectionKey::new(role, key.clone());
            if self
                .collections_by_key
                .get(&by_key)
                .is_some_and(|c| c.ptr_eq(collection))
            {
                self.collections_by_key.remove(&by_key);
            }
        }
        Some(record.entry)
    }

    /// Attached collection for `key`.
    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionHandle> {
        self.collections_by_key.get(key).cloned()
    }

    pub(crate) fn add_collection_by_key(&mut self, key: CollectionKey, collection: &CollectionHandle) {
        self.collections_by_key.insert(key, collection.clone());
    }

    pub(crate) fn clear_collections_by_key(&mut self) {
        self.collections_by_key.clear();
    }

    /// Attached collections in registration order.
    pub fn collection_handles(&self) -> Vec<CollectionHandle> {
        let mut records: Vec<&CollectionRecord> = self.collections.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.collection.clone()).collect()
    }

    /// Number of attached collections.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Owner of the collection registered under `role` and `key`.
    pub fn get_collection_owner(&self, role: &str, key: &Value) -> Option<EntityHandle> {
        let collection = self
            .collections_by_key
            .get(&CollectionKey::new(role, key.clone()))?;
        self.get_collection_entry(collection)
            .and_then(|e| e.owner().cloned())
    }

    /// Owner of a collection whose rows exist in the database.
    pub fn get_loaded_collection_owner_or_null(&self, collection: &CollectionHandle) -> Option<EntityHandle> {
        let entry = self.get_collection_entry(collection)?;
        entry.loaded_key()?;
        entry.owner().cloned()
    }

    // ========================================================================
    // Read-only
    // ========================================================================

    /// Are newly loaded instances read-only by default?
    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Change the default for newly loaded instances.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    fn not_associated(entity: &EntityHandle) -> Error {
        Error::TransientObject(format!(
            "instance was not associated with this persistence context: {entity:?}"
        ))
    }

    /// Is a managed instance (or proxy) read-only?
    pub fn is_read_only(&self, entity: &EntityHandle) -> Result<bool> {
        if entity.is_proxy() {
            if !self.contains_proxy(entity) {
                return Err(Self::not_associated(entity));
            }
            return match entity.implementation() {
                Some(target) => self.is_read_only(&target),
                None => Ok(entity.proxy_read_only().unwrap_or(self.default_read_only)),
            };
        }
        self.get_entry(entity)
            .map(EntityEntry::is_read_only)
            .ok_or_else(|| Self::not_associated(entity))
    }

    /// Make a managed instance (or proxy) read-only or writable.
    pub fn set_read_only(&mut self, entity: &EntityHandle, read_only: bool) -> Result<()> {
        if entity.is_proxy() {
            if !self.contains_proxy(entity) {
                return Err(Self::not_associated(entity));
            }
            entity.set_proxy_read_only(read_only);
            return match entity.implementation() {
                Some(target) => self.set_read_only(&target, read_only),
                None => Ok(()),
            };
        }
        let entry = self
            .get_entry_mut(entity)
            .ok_or_else(|| Self::not_associated(entity))?;
        entry.set_read_only(read_only, entity)?;
        if !read_only {
            self.has_non_read_only_entities = true;
        }
        Ok(())
    }

    // ========================================================================
    // Flush and cascade state
    // ========================================================================

    /// Current cascade nesting depth.
    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub(crate) fn increment_cascade_level(&mut self) {
        self.cascade_level += 1;
    }

    pub(crate) fn decrement_cascade_level(&mut self) {
        self.cascade_level = self.cascade_level.saturating_sub(1);
    }

    /// Is a flush running?
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub(crate) fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Remember that references to `key` may need nulling during flush.
    pub(crate) fn register_nullifiable_key(&mut self, key: EntityKey) {
        self.nullifiable_keys.insert(key);
    }

    /// Is `key` scheduled for deletion in this flush?
    pub fn is_nullifiable(&self, key: &EntityKey) -> bool {
        self.nullifiable_keys.contains(key)
    }

    pub(crate) fn clear_nullifiable_keys(&mut self) {
        self.nullifiable_keys.clear();
    }

    // ========================================================================
    // Inserted keys and delayed identity inserts
    // ========================================================================

    /// Record that the row `entity_name#id` was inserted by this session.
    pub fn register_inserted_key(&mut self, entity_name: &str, id: &Value) {
        self.inserted_keys
            .entry(entity_name.to_string())
            .or_default()
            .push(id.clone());
    }

    /// Was `entity_name#id` inserted by this session's current transaction?
    pub fn was_inserted_during_transaction(&self, entity_name: &str, id: &Value) -> bool {
        self.inserted_keys
            .get(entity_name)
            .is_some_and(|ids| ids.iter().any(|i| i.same_identifier(id)))
    }

    /// Forget inserted keys at transaction end.
    pub fn clear_inserted_keys(&mut self) {
        self.inserted_keys.clear();
    }

    /// Move an instance from its placeholder key to the identifier the
    /// database generated.
    pub fn replace_delayed_entity_identity_insert_keys(
        &mut self,
        old_key: &EntityKey,
        new_id: Value,
    ) -> Result<EntityKey> {
        let entity = self.entities_by_key.remove(old_key).ok_or_else(|| {
            Error::AssertionFailure(format!("no instance registered under placeholder {old_key}"))
        })?;
        if let Some(entry) = self.get_entry_mut(&entity) {
            entry.set_id(new_id.clone());
        }
        let new_key = EntityKey::new(old_key.root_name(), new_id);
        tracing::trace!(old = %old_key, new = %new_key, "Replacing delayed identity insert key");
        self.check_uniqueness(&new_key, &entity)?;
        self.entities_by_key.insert(new_key.clone(), entity);
        Ok(new_key)
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entities", &self.entities_by_key.len())
            .field("entries", &self.entries.len())
            .field("proxies", &self.proxies_by_key.len())
            .field("collections", &self.collections.len())
            .field("cascade_level", &self.cascade_level)
            .field("flushing", &self.flushing)
            .finish()
    }
}
