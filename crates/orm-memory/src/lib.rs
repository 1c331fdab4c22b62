//! In-memory collaborators for the ORM session.
//!
//! `MemoryDatabase` stores rows for every entity table and collection role
//! and records each executed statement. `MemoryEntityPersister` and
//! `MemoryCollectionPersister` implement the persister contracts on top of
//! it, and `MemoryRegion` is a read-write second-level cache region with
//! soft locks.

pub mod collection_persister;
pub mod database;
pub mod entity_persister;
pub mod region;

pub use collection_persister::MemoryCollectionPersister;
pub use database::{MemoryDatabase, Statement, StoredRow};
pub use entity_persister::MemoryEntityPersister;
pub use region::{MemoryRegion, RegionCounters};
