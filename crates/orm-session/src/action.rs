//! Executable actions queued by a session.
//!
//! Entity actions write one row; collection actions write the rows of one
//! collection. Writes to cached data take a soft lock before the database
//! call and hand it to an [`AfterCompletion`] process, which finishes the
//! cache protocol once the transaction outcome is known.

use crate::collection_entry::added_elements;
use crate::factory::SessionFactory;
use crate::key::EntityKey;
use crate::persistence_context::PersistenceContext;
use orm_core::{
    CacheEntry, CacheKey, CacheMode, CollectionHandle, CollectionPersister, EntityHandle,
    EntityPersister, Error, PropertyValue, RegionAccessStrategy, Result, SoftLock,
    SoftLockGuard, Value, disassemble, disassemble_elements,
};
use std::fmt;
use std::sync::Arc;

/// Session state an action runs against.
pub(crate) struct ExecutionContext<'a> {
    pub(crate) pc: &'a mut PersistenceContext,
    pub(crate) factory: &'a SessionFactory,
    pub(crate) cache_mode: CacheMode,
}

/// A queued database write.
pub(crate) trait Executable {
    /// Run the write. Returns the cache work to finish at transaction end.
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<AfterCompletion>>;

    /// Does this action write rows of `space` (an entity name or collection role)?
    fn affects(&self, space: &str) -> bool;
}

fn record_optimistic_failure(factory: &SessionFactory, error: &Error) {
    if error.is_optimistic_failure() {
        factory.statistics().optimistic_failure();
    }
}

fn entity_affects(persister: &dyn EntityPersister, space: &str) -> bool {
    let metadata = persister.metadata();
    metadata.name == space || metadata.root_name() == space
}

// ============================================================================
// Cache locks held across a write
// ============================================================================

struct CacheLock {
    cache: Arc<dyn RegionAccessStrategy>,
    guard: SoftLockGuard,
}

impl CacheLock {
    fn acquire(
        cache: Option<Arc<dyn RegionAccessStrategy>>,
        key: CacheKey,
        version: &Value,
    ) -> Result<Option<Self>> {
        let Some(cache) = cache else {
            return Ok(None);
        };
        let guard = SoftLockGuard::acquire(Arc::clone(&cache), key, version)?;
        Ok(Some(Self { cache, guard }))
    }

    /// Remove the item now and keep it locked until the transaction ends.
    fn invalidate(self) -> Result<AfterCompletion> {
        self.cache.remove(self.guard.key())?;
        let key = self.guard.key().clone();
        Ok(AfterCompletion::Unlock {
            cache: self.cache,
            key,
            lock: self.guard.hand_off(),
        })
    }
}

// ============================================================================
// Entity actions
// ============================================================================

/// Insert of one new row.
pub struct EntityInsertAction {
    entity: EntityHandle,
    id: Value,
    state: Vec<PropertyValue>,
    version: Value,
    persister: Arc<dyn EntityPersister>,
    identity: bool,
}

impl EntityInsertAction {
    pub(crate) fn new(
        entity: EntityHandle,
        id: Value,
        state: Vec<PropertyValue>,
        version: Value,
        persister: Arc<dyn EntityPersister>,
    ) -> Self {
        let identity = persister.metadata().uses_identity();
        Self {
            entity,
            id,
            state,
            version,
            persister,
            identity,
        }
    }

    /// Instance being inserted.
    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    /// Entity name.
    pub fn entity_name(&self) -> &str {
        self.persister.entity_name()
    }

    /// Identifier, or the placeholder of a pending identity insert.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Does the database generate the identifier?
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Entities this row references through to-one associations.
    pub(crate) fn referenced_entities(&self) -> Vec<EntityHandle> {
        let mut referenced = Vec::new();
        collect_entities(&self.state, &mut referenced);
        referenced
    }
}

fn collect_entities(state: &[PropertyValue], into: &mut Vec<EntityHandle>) {
    for value in state {
        match value {
            PropertyValue::Entity(Some(e)) => into.push(e.clone()),
            PropertyValue::Component(Some(nested)) => collect_entities(nested, into),
            _ => {}
        }
    }
}

impl Executable for EntityInsertAction {
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<AfterCompletion>> {
        let persister = Arc::clone(&self.persister);
        let metadata = persister.metadata();
        let values = disassemble(&self.state);

        let id = if self.identity {
            let generated = persister.insert_identity(&values, &self.version)?;
            let placeholder = EntityKey::for_entity(metadata, self.id.clone());
            let registered = ctx
                .pc
                .get_entity(&placeholder)
                .is_some_and(|e| e.ptr_eq(&self.entity));
            if registered {
                ctx.pc
                    .replace_delayed_entity_identity_insert_keys(&placeholder, generated.clone())?;
            }
            self.entity.set_id(generated.clone());
            generated
        } else {
            persister.insert(&self.id, &values, &self.version)?;
            self.id.clone()
        };

        if let Some(entry) = ctx.pc.get_entry_mut(&self.entity) {
            entry.post_insert(id.clone());
        }
        ctx.pc.register_inserted_key(persister.entity_name(), &id);
        self.id = id.clone();
        ctx.factory.statistics().entity_inserted();
        tracing::debug!(entity = %persister.entity_name(), id = %id, "Inserted entity");

        if !ctx.cache_mode.is_put_enabled() {
            return Ok(None);
        }
        Ok(ctx
            .factory
            .entity_cache(persister.as_ref())
            .map(|cache| AfterCompletion::Insert {
                cache,
                key: CacheKey::entity(metadata.root_name(), id),
                entry: CacheEntry {
                    subclass: metadata.name.clone(),
                    state: disassemble(&self.state),
                    version: self.version.clone(),
                },
                version: self.version.clone(),
            }))
    }

    fn affects(&self, space: &str) -> bool {
        entity_affects(self.persister.as_ref(), space)
    }
}

impl fmt::Debug for EntityInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInsertAction")
            .field("entity", &self.entity)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Update of one dirty row.
pub struct EntityUpdateAction {
    entity: EntityHandle,
    id: Value,
    state: Vec<PropertyValue>,
    dirty: Vec<usize>,
    previous_version: Value,
    next_version: Value,
    persister: Arc<dyn EntityPersister>,
}

impl EntityUpdateAction {
    pub(crate) fn new(
        entity: EntityHandle,
        id: Value,
        state: Vec<PropertyValue>,
        dirty: Vec<usize>,
        previous_version: Value,
        next_version: Value,
        persister: Arc<dyn EntityPersister>,
    ) -> Self {
        Self {
            entity,
            id,
            state,
            dirty,
            previous_version,
            next_version,
            persister,
        }
    }

    /// Instance being updated.
    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    /// Entity name.
    pub fn entity_name(&self) -> &str {
        self.persister.entity_name()
    }

    /// Identifier.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Indexes of the changed properties.
    pub fn dirty_properties(&self) -> &[usize] {
        &self.dirty
    }
}

impl Executable for EntityUpdateAction {
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<AfterCompletion>> {
        if self.id.is_generated_placeholder() {
            self.id = self.entity.id();
        }
        let persister = Arc::clone(&self.persister);
        let metadata = persister.metadata();
        let key = CacheKey::entity(metadata.root_name(), self.id.clone());
        let lock = CacheLock::acquire(
            ctx.factory.entity_cache(persister.as_ref()),
            key.clone(),
            &self.previous_version,
        )?;

        let values = disassemble(&self.state);
        if let Err(e) = persister.update(
            &self.id,
            &values,
            &self.dirty,
            &self.previous_version,
            &self.next_version,
        ) {
            record_optimistic_failure(ctx.factory, &e);
            return Err(e);
        }

        if let Some(entry) = ctx.pc.get_entry_mut(&self.entity) {
            entry.post_update(&self.entity, self.state.clone(), self.next_version.clone());
        }
        ctx.factory.statistics().entity_updated();
        tracing::debug!(
            entity = %persister.entity_name(),
            id = %self.id,
            dirty = self.dirty.len(),
            "Updated entity"
        );

        let Some(lock) = lock else {
            return Ok(None);
        };
        if !ctx.cache_mode.is_put_enabled() {
            return lock.invalidate().map(Some);
        }
        let version = if persister.is_versioned() {
            self.next_version.clone()
        } else {
            Value::Null
        };
        Ok(Some(AfterCompletion::Update {
            cache: lock.cache,
            key,
            entry: CacheEntry {
                subclass: metadata.name.clone(),
                state: values,
                version: version.clone(),
            },
            version,
            previous_version: self.previous_version.clone(),
            lock: lock.guard.hand_off(),
        }))
    }

    fn affects(&self, space: &str) -> bool {
        entity_affects(self.persister.as_ref(), space)
    }
}

impl fmt::Debug for EntityUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityUpdateAction")
            .field("entity", &self.entity)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// Delete of one row.
pub struct EntityDeleteAction {
    entity: EntityHandle,
    id: Value,
    version: Value,
    persister: Arc<dyn EntityPersister>,
    orphan: bool,
}

impl EntityDeleteAction {
    pub(crate) fn new(
        entity: EntityHandle,
        id: Value,
        version: Value,
        persister: Arc<dyn EntityPersister>,
        orphan: bool,
    ) -> Self {
        Self {
            entity,
            id,
            version,
            persister,
            orphan,
        }
    }

    /// Instance being deleted.
    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    /// Entity name.
    pub fn entity_name(&self) -> &str {
        self.persister.entity_name()
    }

    /// Identifier.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Was the instance removed from a delete-orphan collection?
    pub fn is_orphan_removal(&self) -> bool {
        self.orphan
    }
}

impl Executable for EntityDeleteAction {
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<AfterCompletion>> {
        if self.id.is_generated_placeholder() {
            self.id = self.entity.id();
        }
        let persister = Arc::clone(&self.persister);
        let metadata = persister.metadata();
        let lock = CacheLock::acquire(
            ctx.factory.entity_cache(persister.as_ref()),
            CacheKey::entity(metadata.root_name(), self.id.clone()),
            &self.version,
        )?;

        if let Err(e) = persister.delete(&self.id, &self.version) {
            record_optimistic_failure(ctx.factory, &e);
            return Err(e);
        }

        if let Some(mut entry) = ctx.pc.remove_entry(&self.entity) {
            entry.post_delete();
        }
        let key = EntityKey::for_entity(metadata, self.id.clone());
        ctx.pc.remove_entity(&key);
        ctx.pc.remove_proxy(&key);
        ctx.factory.statistics().entity_deleted();
        tracing::debug!(
            entity = %persister.entity_name(),
            id = %self.id,
            orphan = self.orphan,
            "Deleted entity"
        );

        lock.map(CacheLock::invalidate).transpose()
    }

    fn affects(&self, space: &str) -> bool {
        entity_affects(self.persister.as_ref(), space)
    }
}

impl fmt::Debug for EntityDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDeleteAction")
            .field("entity", &self.entity)
            .field("orphan", &self.orphan)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Collection actions
// ============================================================================

/// Which collection write to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionActionKind {
    /// Write every element under a new key.
    Recreate,
    /// Remove every row under the loaded key.
    Remove,
    /// Write the difference against the snapshot.
    Update,
}

/// A write of one collection's rows.
pub struct CollectionAction {
    kind: CollectionActionKind,
    collection: Option<CollectionHandle>,
    owner: Option<EntityHandle>,
    key: Value,
    persister: Arc<dyn CollectionPersister>,
}

impl CollectionAction {
    pub(crate) fn new(
        kind: CollectionActionKind,
        collection: Option<CollectionHandle>,
        owner: Option<EntityHandle>,
        key: Value,
        persister: Arc<dyn CollectionPersister>,
    ) -> Self {
        Self {
            kind,
            collection,
            owner,
            key,
            persister,
        }
    }

    /// Kind of write.
    pub fn kind(&self) -> CollectionActionKind {
        self.kind
    }

    /// Collection role.
    pub fn role(&self) -> &str {
        self.persister.role()
    }

    /// Owner key the rows are written under.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// The collection, absent for removals of a collection that was replaced.
    pub fn collection(&self) -> Option<&CollectionHandle> {
        self.collection.as_ref()
    }

    /// Resolve a placeholder key once the owner's identity insert has run.
    fn resolved_key(&self) -> Value {
        match &self.owner {
            Some(owner) if self.key.is_generated_placeholder() => owner.id(),
            _ => self.key.clone(),
        }
    }

    fn write(&self, ctx: &mut ExecutionContext<'_>, key: &Value) -> Result<()> {
        let persister = self.persister.as_ref();
        match self.kind {
            CollectionActionKind::Recreate => {
                let collection = self.require_collection()?;
                let elements = disassemble_elements(&collection.loaded_elements());
                persister.recreate(key, &elements)?;
                ctx.factory.statistics().collection_recreated();
            }
            CollectionActionKind::Remove => {
                persister.remove(key)?;
                ctx.factory.statistics().collection_removed();
            }
            CollectionActionKind::Update => {
                let collection = self.require_collection()?;
                if !collection.is_initialized() {
                    return Ok(());
                }
                let current = collection.loaded_elements();
                let snapshot: Vec<_> = ctx
                    .pc
                    .get_collection_entry(collection)
                    .and_then(|e| e.snapshot().map(<[_]>::to_vec))
                    .unwrap_or_default();
                if current.is_empty() {
                    if !snapshot.is_empty() {
                        persister.remove(key)?;
                    }
                } else {
                    let removed = added_elements(&current, &snapshot);
                    let inserted = added_elements(&snapshot, &current);
                    persister.delete_rows(key, &disassemble_elements(&removed))?;
                    persister.insert_rows(key, &disassemble_elements(&inserted))?;
                }
                ctx.factory.statistics().collection_updated();
            }
        }
        Ok(())
    }

    fn require_collection(&self) -> Result<&CollectionHandle> {
        self.collection.as_ref().ok_or_else(|| {
            Error::AssertionFailure(format!(
                "{:?} of {} needs the collection instance",
                self.kind,
                self.persister.role()
            ))
        })
    }
}

impl Executable for CollectionAction {
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<Option<AfterCompletion>> {
        let key = self.resolved_key();
        let lock = CacheLock::acquire(
            ctx.factory.collection_cache(self.persister.as_ref()),
            CacheKey::collection(self.persister.role(), key.clone()),
            &Value::Null,
        )?;

        self.write(ctx, &key)?;

        if let Some(collection) = &self.collection {
            let written_key = match self.kind {
                CollectionActionKind::Remove => None,
                _ => Some(key.clone()),
            };
            if let Some(entry) = ctx.pc.get_collection_entry_mut(collection) {
                entry.after_action(collection, written_key);
            }
        }
        tracing::debug!(role = %self.persister.role(), key = %key, kind = ?self.kind, "Wrote collection");
        self.key = key;

        lock.map(CacheLock::invalidate).transpose()
    }

    fn affects(&self, space: &str) -> bool {
        let metadata = self.persister.metadata();
        metadata.role == space
            || metadata.owner == space
            || metadata.element_entity().is_some_and(|e| e == space)
    }
}

impl fmt::Debug for CollectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionAction")
            .field("kind", &self.kind)
            .field("role", &self.persister.role())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transaction completion processes
// ============================================================================

/// Cache work finished once the transaction outcome is known.
pub enum AfterCompletion {
    /// Cache a freshly inserted row on commit.
    Insert {
        cache: Arc<dyn RegionAccessStrategy>,
        key: CacheKey,
        entry: CacheEntry,
        version: Value,
    },
    /// Replace a locked item on commit, unlock it on rollback.
    Update {
        cache: Arc<dyn RegionAccessStrategy>,
        key: CacheKey,
        entry: CacheEntry,
        version: Value,
        previous_version: Value,
        lock: Option<SoftLock>,
    },
    /// Unlock an invalidated item.
    Unlock {
        cache: Arc<dyn RegionAccessStrategy>,
        key: CacheKey,
        lock: Option<SoftLock>,
    },
}

impl AfterCompletion {
    /// Finish the cache protocol.
    pub(crate) fn run(self, success: bool, factory: &SessionFactory) -> Result<()> {
        match self {
            AfterCompletion::Insert {
                cache,
                key,
                entry,
                version,
            } => {
                if success && cache.after_insert(&key, &entry, &version)? {
                    factory.statistics().cache_put(cache.region_name());
                }
                Ok(())
            }
            AfterCompletion::Update {
                cache,
                key,
                entry,
                version,
                previous_version,
                lock,
            } => {
                if success {
                    if cache.after_update(&key, &entry, &version, &previous_version, lock.as_ref())? {
                        factory.statistics().cache_put(cache.region_name());
                    }
                    Ok(())
                } else {
                    cache.unlock_item(&key, lock.as_ref())
                }
            }
            AfterCompletion::Unlock { cache, key, lock } => cache.unlock_item(&key, lock.as_ref()),
        }
    }
}

impl fmt::Debug for AfterCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AfterCompletion::Insert { key, .. } => write!(f, "AfterCompletion::Insert({key})"),
            AfterCompletion::Update { key, .. } => write!(f, "AfterCompletion::Update({key})"),
            AfterCompletion::Unlock { key, .. } => write!(f, "AfterCompletion::Unlock({key})"),
        }
    }
}

/// Version work that must run right before commit.
pub enum BeforeCompletion {
    /// Fail the commit if another transaction changed the row's version.
    VerifyVersion { entity: EntityHandle },
    /// Bump the row's version.
    IncrementVersion { entity: EntityHandle },
}

impl BeforeCompletion {
    pub(crate) fn run(self, pc: &mut PersistenceContext, factory: &SessionFactory) -> Result<()> {
        match self {
            BeforeCompletion::VerifyVersion { entity } => {
                let Some(entry) = pc.get_entry(&entity) else {
                    return Ok(());
                };
                let persister = Arc::clone(entry.persister());
                let Some(version_type) = persister.version_type() else {
                    return Ok(());
                };
                let current = persister.load(entry.id(), orm_core::LockMode::None)?;
                let matches = current.is_some_and(|row| version_type.is_equal(&row.version, entry.version()));
                if !matches {
                    let error = Error::stale_state(entry.entity_name(), entry.id());
                    record_optimistic_failure(factory, &error);
                    return Err(error);
                }
                Ok(())
            }
            BeforeCompletion::IncrementVersion { entity } => {
                let Some(entry) = pc.get_entry_mut(&entity) else {
                    return Ok(());
                };
                let persister = Arc::clone(entry.persister());
                let next = persister
                    .force_version_increment(entry.id(), entry.version())
                    .inspect_err(|e| record_optimistic_failure(factory, e))?;
                entry.force_locked(&entity, next);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for BeforeCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeforeCompletion::VerifyVersion { entity } => {
                write!(f, "BeforeCompletion::VerifyVersion({entity:?})")
            }
            BeforeCompletion::IncrementVersion { entity } => {
                write!(f, "BeforeCompletion::IncrementVersion({entity:?})")
            }
        }
    }
}
