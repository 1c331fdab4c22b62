//! Session, persistence context and event listeners.
//!
//! `orm-session` is the **unit-of-work layer** of the ORM. A [`Session`]
//! owns one [`PersistenceContext`] (the identity map plus per-instance
//! bookkeeping) and one [`ActionQueue`] (pending writes), and routes every
//! operation through an event listener:
//!
//! - **save / persist / save-or-update / update / merge** attach or copy instances
//! - **lock** upgrades row locks, bracketed by second-level cache soft locks
//! - **delete** schedules removals, cascading to dependents first
//! - **flush** dirty-checks every managed instance and executes the queue
//! - **get / load / refresh / evict / replicate** move state between the
//!   database, the cache and the context
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder()
//!     .entity(Arc::new(MemoryEntityPersister::new(team_meta, db.clone())))
//!     .build()?;
//! let mut session = factory.open_session();
//!
//! let team = EntityHandle::new(&team_meta);
//! team.set("name", Value::from("Core"))?;
//! let id = session.save(&team)?;
//!
//! session.commit()?;
//! ```

pub mod action;
pub mod action_queue;
pub mod cascade;
pub mod collection_entry;
pub mod config;
pub mod entry;
pub mod event;
pub mod factory;
pub mod key;
pub mod persistence_context;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{
    AfterCompletion, BeforeCompletion, CollectionAction, CollectionActionKind,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
};
pub use action_queue::{ActionQueue, InsertActionSorter, QueueCounts};
pub use cascade::{CascadeContext, CascadePoint, CascadingAction};
pub use collection_entry::CollectionEntry;
pub use config::{FlushMode, SessionConfig, SessionFactoryOptions};
pub use entry::{EntityEntry, Status};
pub use event::{CopyCache, EntityState, ReplicationMode};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use key::{CollectionKey, EntityKey};
pub use persistence_context::PersistenceContext;

use crate::action::ExecutionContext;
use orm_core::{
    CacheMode, EntityHandle, EntityPersister, Error, LockMode, Result, Timestamper, Value,
};
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Callback fired at a session lifecycle point.
///
/// Returning `Err` aborts the operation (e.g., prevents commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callback fired for one instance.
type EntityEventFn = Box<dyn FnMut(&EntityHandle) -> Result<()> + Send>;

/// Callback fired with every instance a flush touched.
type PostFlushFn = Box<dyn FnMut(&[EntityHandle]) -> Result<()> + Send>;

/// Holds registered session-level callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
    pre_insert: Vec<EntityEventFn>,
    pre_load: Vec<EntityEventFn>,
    post_flush: Vec<PostFlushFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .field("pre_insert", &self.pre_insert.len())
            .field("pre_load", &self.pre_load.len())
            .field("post_flush", &self.post_flush.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }

    fn fire_pre_insert(&mut self, entity: &EntityHandle) -> Result<()> {
        for cb in &mut self.pre_insert {
            cb(entity)?;
        }
        Ok(())
    }

    fn fire_pre_load(&mut self, entity: &EntityHandle) -> Result<()> {
        for cb in &mut self.pre_load {
            cb(entity)?;
        }
        Ok(())
    }

    fn fire_post_flush(&mut self, entities: &[EntityHandle]) -> Result<()> {
        for cb in &mut self.post_flush {
            cb(entities)?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work.
///
/// A session is confined to one thread at a time: it has no internal
/// locking, and every operation runs to completion synchronously.
pub struct Session {
    factory: Arc<SessionFactory>,
    pc: PersistenceContext,
    action_queue: ActionQueue,
    config: SessionConfig,
    callbacks: SessionEventCallbacks,
    timestamp: u64,
    enabled_filters: HashSet<String>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(factory: Arc<SessionFactory>, config: SessionConfig) -> Self {
        let options = factory.options();
        let action_queue = ActionQueue::new(options.order_inserts, options.order_updates);
        tracing::debug!(
            flush_mode = ?config.flush_mode,
            cache_mode = ?config.cache_mode,
            "Opening session"
        );
        Self {
            pc: PersistenceContext::new(config.default_read_only),
            action_queue,
            config,
            callbacks: SessionEventCallbacks::default(),
            timestamp: Timestamper::next(),
            enabled_filters: HashSet::new(),
            closed: false,
            factory,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The factory that opened this session.
    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    /// The persistence context.
    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.pc
    }

    /// The queue of pending writes.
    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Change the flush mode.
    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.config.flush_mode = mode;
    }

    /// Change the cache mode.
    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.config.cache_mode = mode;
    }

    /// Cache timestamp of the current transaction.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Has the session been closed?
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Usage("session is closed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn execution_context(&mut self) -> (ExecutionContext<'_>, &mut ActionQueue) {
        (
            ExecutionContext {
                pc: &mut self.pc,
                factory: &self.factory,
                cache_mode: self.config.cache_mode,
            },
            &mut self.action_queue,
        )
    }

    pub(crate) fn persister_for(&self, entity: &EntityHandle) -> Result<Arc<dyn EntityPersister>> {
        self.factory.entity_persister(&entity.entity_name())
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Enable a named filter. Collections affected by enabled filters bypass
    /// the second-level cache.
    pub fn enable_filter(&mut self, name: impl Into<String>) {
        self.enabled_filters.insert(name.into());
    }

    /// Disable a named filter.
    pub fn disable_filter(&mut self, name: &str) {
        self.enabled_filters.remove(name);
    }

    /// Names of enabled filters.
    pub fn enabled_filters(&self) -> &HashSet<String> {
        &self.enabled_filters
    }

    // ========================================================================
    // Event registration
    // ========================================================================

    /// Register a callback that fires before flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback that fires after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback that fires before commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback that fires after commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback that fires after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_rollback.push(Box::new(f));
    }

    /// Register a callback that fires when an instance is scheduled for insertion.
    pub fn on_pre_insert(&mut self, f: impl FnMut(&EntityHandle) -> Result<()> + Send + 'static) {
        self.callbacks.pre_insert.push(Box::new(f));
    }

    /// Register a callback that fires before a loaded instance is populated.
    pub fn on_pre_load(&mut self, f: impl FnMut(&EntityHandle) -> Result<()> + Send + 'static) {
        self.callbacks.pre_load.push(Box::new(f));
    }

    /// Register a callback that receives every managed instance after a flush.
    pub fn on_post_flush(
        &mut self,
        f: impl FnMut(&[EntityHandle]) -> Result<()> + Send + 'static,
    ) {
        self.callbacks.post_flush.push(Box::new(f));
    }

    // ========================================================================
    // Context inspection
    // ========================================================================

    /// Is `entity` managed by this session (or a proxy registered with it)?
    pub fn contains(&self, entity: &EntityHandle) -> bool {
        if entity.is_proxy() {
            if !self.pc.contains_proxy(entity) {
                return false;
            }
            return match entity.implementation() {
                Some(target) => self.pc.is_entry_for(&target),
                None => true,
            };
        }
        self.pc
            .get_entry(entity)
            .is_some_and(|e| !e.status().is_deleted_or_gone())
    }

    /// Lifecycle status of a managed instance.
    pub fn entry_status(&self, entity: &EntityHandle) -> Option<Status> {
        let target = entity.implementation()?;
        self.pc.get_entry(&target).map(EntityEntry::status)
    }

    /// Lock mode held on a managed instance.
    pub fn get_current_lock_mode(&self, entity: &EntityHandle) -> Result<LockMode> {
        self.check_open()?;
        if entity.is_uninitialized() {
            return Err(Error::TransientObject(
                "cannot read the lock mode of an uninitialized proxy".to_string(),
            ));
        }
        let target = entity.implementation().unwrap_or_else(|| entity.clone());
        let entry = self.pc.get_entry(&target).ok_or_else(|| {
            Error::TransientObject(format!(
                "given object not associated with the session: {entity:?}"
            ))
        })?;
        if entry.status().is_deleted_or_gone() {
            return Err(Error::object_deleted(
                entry.entity_name(),
                entry.id(),
                "the given object was deleted",
            ));
        }
        Ok(entry.lock_mode())
    }

    /// Identifier of a managed instance or proxy.
    pub fn get_identifier(&self, entity: &EntityHandle) -> Result<Value> {
        self.check_open()?;
        if entity.is_proxy() {
            if !self.pc.contains_proxy(entity) {
                return Err(Error::TransientObject(
                    "the proxy was not associated with this session".to_string(),
                ));
            }
            return Ok(entity.id());
        }
        self.pc
            .get_entry(entity)
            .map(|e| e.id().clone())
            .ok_or_else(|| {
                Error::TransientObject(
                    "the instance was not associated with this session".to_string(),
                )
            })
    }

    /// Is a managed instance or proxy read-only?
    pub fn is_read_only(&self, entity: &EntityHandle) -> Result<bool> {
        self.check_open()?;
        self.pc.is_read_only(entity)
    }

    /// Make a managed instance or proxy read-only or writable.
    pub fn set_read_only(&mut self, entity: &EntityHandle, read_only: bool) -> Result<()> {
        self.check_open()?;
        self.pc.set_read_only(entity, read_only)
    }

    /// Are newly loaded instances read-only by default?
    pub fn is_default_read_only(&self) -> bool {
        self.pc.is_default_read_only()
    }

    /// Change the read-only default for instances loaded from now on.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.pc.set_default_read_only(read_only);
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Flush (unless the flush mode is manual), run before-completion
    /// version work and finish the cache protocol.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        if self.config.flush_mode.flushes_on_commit() {
            self.flush()?;
        }
        self.callbacks.fire(SessionEvent::BeforeCommit)?;
        let before = self
            .action_queue
            .before_transaction_completion(&mut self.pc, &self.factory);
        if let Err(e) = before {
            self.after_transaction_completion(false);
            return Err(e);
        }
        self.after_transaction_completion(true);
        tracing::info!("Session committed");
        self.callbacks.fire(SessionEvent::AfterCommit)
    }

    /// Discard pending writes and release cache locks.
    ///
    /// The in-memory state of managed instances is left as is; callers are
    /// expected to discard the session after a rollback.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.action_queue.clear();
        self.after_transaction_completion(false);
        tracing::info!("Session rolled back");
        self.callbacks.fire(SessionEvent::AfterRollback)
    }

    fn after_transaction_completion(&mut self, success: bool) {
        self.action_queue
            .after_transaction_completion(success, &self.factory);
        self.pc.clear_inserted_keys();
        for (entity, entry) in self.pc.entries_snapshot() {
            if entry.lock_mode() != LockMode::None {
                if let Some(e) = self.pc.get_entry_mut(&entity) {
                    e.set_lock_mode(LockMode::None);
                }
            }
        }
        self.timestamp = Timestamper::next();
    }

    /// Detach every instance and drop pending writes.
    pub fn clear(&mut self) {
        tracing::debug!(entities = self.pc.entity_count(), "Clearing session");
        self.action_queue.clear();
        self.action_queue
            .after_transaction_completion(false, &self.factory);
        self.pc.clear();
    }

    /// Close the session. Pending writes are discarded.
    pub fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.clear();
        self.closed = true;
        self.factory.statistics().session_closed();
        tracing::debug!("Session closed");
        Ok(())
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Number of managed instances.
    pub fn managed_count(&self) -> usize {
        self.pc.entry_count()
    }

    /// Number of queued insertions.
    pub fn pending_insert_count(&self) -> usize {
        self.action_queue.insertions_count()
    }

    /// Number of queued updates.
    pub fn pending_update_count(&self) -> usize {
        self.action_queue.updates_count()
    }

    /// Number of queued deletions.
    pub fn pending_delete_count(&self) -> usize {
        self.action_queue.deletions_count()
    }

    /// Summary of the session's state.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            entities: self.pc.entity_count(),
            entries: self.pc.entry_count(),
            collections: self.pc.collection_count(),
            queued: self.action_queue.counts(),
            cascade_level: self.pc.cascade_level(),
            flush_mode: self.config.flush_mode,
            cache_mode: self.config.cache_mode,
            closed: self.closed,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.action_queue
                .after_transaction_completion(false, &self.factory);
            self.factory.statistics().session_closed();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pc", &self.pc)
            .field("action_queue", &self.action_queue)
            .field("callbacks", &self.callbacks)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    /// Instances in the identity map.
    pub entities: usize,
    /// Entity entries.
    pub entries: usize,
    /// Attached collections.
    pub collections: usize,
    /// Queued actions per list.
    pub queued: QueueCounts,
    /// Current cascade depth.
    pub cascade_level: usize,
    /// Flush mode.
    pub flush_mode: FlushMode,
    /// Cache mode.
    pub cache_mode: CacheMode,
    /// Whether the session is closed.
    pub closed: bool,
}
