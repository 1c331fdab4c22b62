//! Event listeners: one module per session operation.
//!
//! Each listener is an `impl Session` block; the types shared between them
//! live here.

mod collection;
mod delete;
mod dirty_check;
mod evict;
mod flush;
mod load;
mod lock;
mod merge;
mod refresh;
mod replicate;
mod save;
mod update;

use crate::Session;
use crate::key::EntityKey;
use orm_core::{EntityHandle, Error, Result, Value, VersionType};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Where an instance stands relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Has a live entry in this session.
    Persistent,
    /// Has no row yet.
    Transient,
    /// Has a row but no entry in this session.
    Detached,
    /// Has an entry scheduled for (or past) deletion.
    Deleted,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Persistent => "persistent",
            EntityState::Transient => "transient",
            EntityState::Detached => "detached",
            EntityState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// How replicate treats a row that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Fail.
    #[default]
    Exception,
    /// Keep the existing row.
    Ignore,
    /// Replace the existing row.
    Overwrite,
    /// Replace the existing row unless its version is newer.
    LatestVersion,
}

impl ReplicationMode {
    /// Should the replicated state replace a row holding `current_version`?
    pub fn should_overwrite_current_version(
        self,
        entity_name: &str,
        id: &Value,
        current_version: &Value,
        new_version: &Value,
        version_type: Option<VersionType>,
    ) -> Result<bool> {
        match self {
            ReplicationMode::Exception => Err(Error::non_unique(entity_name, id)),
            ReplicationMode::Ignore => Ok(false),
            ReplicationMode::Overwrite => Ok(true),
            ReplicationMode::LatestVersion => {
                if version_type.is_none() || current_version.is_null() {
                    return Ok(true);
                }
                Ok(matches!(
                    current_version.compare_numeric(new_version),
                    Some(Ordering::Less | Ordering::Equal)
                ))
            }
        }
    }
}

/// Original-to-copy identity map of one merge.
///
/// Keys are the instances passed in (by object identity); values are the
/// managed instances their state was copied onto.
#[derive(Default)]
pub struct CopyCache {
    copies: HashMap<usize, (EntityHandle, EntityHandle)>,
}

impl CopyCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of originals merged.
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    /// Has nothing been merged yet?
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Managed copy of `original`.
    pub fn get(&self, original: &EntityHandle) -> Option<EntityHandle> {
        self.copies
            .get(&original.object_id())
            .map(|(_, copy)| copy.clone())
    }

    /// Has `original` been merged?
    pub fn contains(&self, original: &EntityHandle) -> bool {
        self.copies.contains_key(&original.object_id())
    }

    /// Is `entity` the copy of some original?
    pub fn contains_copy(&self, entity: &EntityHandle) -> bool {
        self.copies.values().any(|(_, copy)| copy.ptr_eq(entity))
    }

    pub(crate) fn insert(&mut self, original: &EntityHandle, copy: &EntityHandle) {
        self.copies
            .insert(original.object_id(), (original.clone(), copy.clone()));
    }

    /// Originals in no particular order.
    pub fn originals(&self) -> Vec<EntityHandle> {
        self.copies.values().map(|(o, _)| o.clone()).collect()
    }
}

impl fmt::Debug for CopyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyCache")
            .field("len", &self.copies.len())
            .finish()
    }
}

// ============================================================================
// Classification
// ============================================================================

impl Session {
    /// Classify `entity` against this session.
    ///
    /// `assumed` answers the transient question when neither the interceptor
    /// nor the unsaved-values settle it, avoiding a database snapshot.
    pub(crate) fn entity_state(
        &mut self,
        entity: &EntityHandle,
        assumed: Option<bool>,
    ) -> Result<EntityState> {
        if let Some(entry) = self.pc.get_entry(entity) {
            return Ok(if entry.status().is_deleted_or_gone() {
                EntityState::Deleted
            } else {
                EntityState::Persistent
            });
        }
        if self.is_transient(entity, assumed)? {
            Ok(EntityState::Transient)
        } else {
            Ok(EntityState::Detached)
        }
    }

    /// Does `entity` have no row? Consults, in order: the interceptor, the
    /// unsaved-values, `assumed`, and finally the database.
    pub(crate) fn is_transient(
        &mut self,
        entity: &EntityHandle,
        assumed: Option<bool>,
    ) -> Result<bool> {
        if entity.is_uninitialized() {
            return Ok(false);
        }
        if let Some(transient) = self.factory.interceptor().is_transient(entity) {
            return Ok(transient);
        }
        let persister = self.persister_for(entity)?;
        let id = persister.get_identifier(entity);
        let decided = persister
            .metadata()
            .is_transient_by_unsaved_value(&id, &persister.get_version(entity));
        if let Some(transient) = decided.or(assumed) {
            return Ok(transient);
        }
        let key = EntityKey::for_entity(persister.metadata(), id);
        Ok(self
            .pc
            .get_database_snapshot(&key, persister.as_ref())?
            .is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, fixture, persist_committed, team};

    #[test]
    fn test_latest_version_compares_versions() {
        let mode = ReplicationMode::LatestVersion;
        let vt = Some(VersionType::Integer);
        let id = Value::BigInt(1);
        assert!(mode
            .should_overwrite_current_version("A", &id, &Value::BigInt(1), &Value::BigInt(2), vt)
            .unwrap());
        assert!(!mode
            .should_overwrite_current_version("A", &id, &Value::BigInt(3), &Value::BigInt(2), vt)
            .unwrap());
        assert!(mode
            .should_overwrite_current_version("A", &id, &Value::BigInt(3), &Value::BigInt(2), None)
            .unwrap());
    }

    #[test]
    fn test_exception_mode_rejects_existing_rows() {
        let err = ReplicationMode::Exception
            .should_overwrite_current_version("A", &Value::BigInt(1), &Value::Null, &Value::Null, None)
            .unwrap_err();
        assert!(matches!(err, Error::NonUniqueObject(_)));
        assert!(!ReplicationMode::Ignore
            .should_overwrite_current_version("A", &Value::BigInt(1), &Value::Null, &Value::Null, None)
            .unwrap());
    }

    #[test]
    fn test_copy_cache_tracks_originals_and_copies() {
        let fx = fixture();
        let original = team(&fx, 1, "Reds");
        let copy = team(&fx, 1, "Reds");
        let mut cache = CopyCache::new();
        cache.insert(&original, &copy);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&original));
        assert!(!cache.contains(&copy));
        assert!(cache.contains_copy(&copy));
        assert!(cache.get(&original).unwrap().ptr_eq(&copy));
    }

    #[test]
    fn test_classification() {
        let fx = fixture();
        let saved = account(&fx, "ada");
        persist_committed(&fx, &saved);

        let mut session = fx.factory.open_session();
        assert_eq!(
            session.entity_state(&account(&fx, "bob"), None).unwrap(),
            EntityState::Transient
        );
        assert_eq!(
            session.entity_state(&saved, None).unwrap(),
            EntityState::Detached
        );

        let fresh = team(&fx, 7, "Blues");
        assert_eq!(
            session.entity_state(&fresh, None).unwrap(),
            EntityState::Transient
        );
        assert_eq!(
            session.entity_state(&fresh, Some(false)).unwrap(),
            EntityState::Detached
        );

        session.save(&fresh).unwrap();
        assert_eq!(
            session.entity_state(&fresh, None).unwrap(),
            EntityState::Persistent
        );
    }
}
