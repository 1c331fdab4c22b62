//! Persistence-context ORM core.
//!
//! This crate bundles the pieces of the ORM behind one dependency:
//!
//! - [`orm_core`]: values, entity handles, metadata, the persister and cache
//!   contracts every backend implements
//! - [`orm_session`]: the session, its persistence context, the action queue,
//!   cascades and every event listener
//! - [`orm_memory`]: in-memory persisters and cache regions for tests and
//!   prototyping
//!
//! # Quick Start
//!
//! ```ignore
//! use orm::prelude::*;
//!
//! let db = Arc::new(MemoryDatabase::new());
//! let team = EntityMetadata::new("Team")
//!     .identifier("id", IdGeneration::Assigned)
//!     .property(PropertyMetadata::basic("name"))
//!     .build()?;
//! let factory = SessionFactory::builder()
//!     .entity(Arc::new(MemoryEntityPersister::new(Arc::clone(&team), db)))
//!     .build()?;
//!
//! let mut session = factory.open_session();
//! let reds = EntityHandle::with_id(&team, 1);
//! reds.set("name", Value::from("Reds"))?;
//! session.save(&reds)?;
//! session.commit()?;
//!
//! // Same row, same instance, no second select.
//! let again = session.get("Team", 1)?.expect("saved above");
//! assert!(again.ptr_eq(&reds));
//! ```

pub use orm_core::{
    CacheEntry, CacheKey, CacheMode, CascadeKind, CascadeStyle, CollectionHandle,
    CollectionMetadata, CollectionPersister, Element, ElementKind, EntityHandle, EntityMetadata,
    EntityPersister, Error, IdGeneration, IdUnsavedValue, Interceptor, LoadedRow, LockMode,
    NoopInterceptor, PropertyKind, PropertyMetadata, PropertyValue, RegionAccessStrategy, Result,
    SoftLock, SoftLockGuard, Statistics, StatisticsSnapshot, Value, VersionType,
    VersionUnsavedValue,
};
pub use orm_memory::{MemoryCollectionPersister, MemoryDatabase, MemoryEntityPersister, MemoryRegion};
pub use orm_session::{
    ActionQueue, CascadeContext, CascadingAction, CollectionEntry, CollectionKey, CopyCache,
    EntityEntry, EntityKey, EntityState, FlushMode, PersistenceContext, ReplicationMode, Session,
    SessionConfig, SessionFactory, SessionFactoryBuilder, SessionFactoryOptions, Status,
};

// Sub-crates, for types the root does not re-export.
pub use {orm_core, orm_memory, orm_session};

/// Everything an application needs to map entities and run sessions.
pub mod prelude {
    pub use crate::{
        // Mapping
        CascadeStyle,
        CollectionHandle,
        CollectionMetadata,
        Element,
        EntityHandle,
        EntityMetadata,
        // Errors
        Error,
        IdGeneration,
        // Locking and caching
        CacheMode,
        FlushMode,
        LockMode,
        // Backends
        MemoryCollectionPersister,
        MemoryDatabase,
        MemoryEntityPersister,
        MemoryRegion,
        PropertyMetadata,
        PropertyValue,
        ReplicationMode,
        Result,
        // Sessions
        Session,
        SessionFactory,
        SessionFactoryOptions,
        Value,
        VersionType,
    };
    pub use std::sync::Arc;
}
