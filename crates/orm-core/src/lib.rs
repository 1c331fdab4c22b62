//! Core types and collaborator contracts for the ORM persistence context.
//!
//! This crate provides the leaf abstractions the session is built on:
//!
//! - `Value` for dynamically typed column values and identifiers
//! - `EntityMetadata` / `CollectionMetadata` describing mappings
//! - `EntityHandle` / `CollectionHandle` for shared entity and collection instances
//! - `EntityPersister` / `CollectionPersister` for database execution
//! - `RegionAccessStrategy` and soft locks for the second-level cache
//! - `Interceptor` and `Statistics` for application hooks and counters

pub mod cache;
pub mod cascade;
pub mod collection;
pub mod error;
pub mod interceptor;
pub mod lock;
pub mod metadata;
pub mod object;
pub mod persister;
pub mod stats;
pub mod value;
pub mod version;

pub use cache::{
    CacheEntry, CacheKey, CacheKeyKind, CacheMode, ONE_MS, RegionAccessStrategy,
    SOFT_LOCK_TIMEOUT, SoftLock, SoftLockGuard, Timestamper,
};
pub use cascade::{CascadeKind, CascadeStyle};
pub use collection::{CollectionHandle, Element, PersistentCollection};
pub use error::{CacheError, EntityErrorInfo, Error, PersisterError, PersisterErrorKind, Result};
pub use interceptor::{Interceptor, NoopInterceptor};
pub use lock::LockMode;
pub use metadata::{
    CollectionMetadata, ElementKind, EntityMetadata, ForeignKeyDirection, IdGeneration,
    IdUnsavedValue, PropertyKind, PropertyMetadata, VersionMetadata, VersionUnsavedValue,
};
pub use object::{EntityHandle, EntityObject, LazyInitializer, PropertyValue};
pub use persister::{
    CollectionPersister, EntityPersister, LoadedRow, disassemble, disassemble_elements,
};
pub use stats::{RegionStatistics, Statistics, StatisticsSnapshot};
pub use value::Value;
pub use version::VersionType;
