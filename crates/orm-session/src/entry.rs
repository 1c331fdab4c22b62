//! Per-instance bookkeeping kept by the persistence context.

use orm_core::{EntityHandle, EntityPersister, Error, LockMode, PropertyValue, Result, Value};
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Persistent and writable.
    Managed,
    /// Persistent, never dirty-checked.
    ReadOnly,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted from the database.
    Gone,
    /// Scheduled for insertion but not yet written.
    Saving,
}

impl Status {
    /// Is moving from `self` to `next` a legal transition?
    ///
    /// Statuses only move forward, except that `Managed` and `ReadOnly`
    /// may switch back and forth.
    pub const fn can_become(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Saving, _)
                | (Status::Managed | Status::ReadOnly, Status::Managed | Status::ReadOnly)
                | (Status::Managed | Status::ReadOnly, Status::Deleted)
                | (Status::Deleted, Status::Deleted | Status::Gone)
                | (Status::Gone, Status::Gone)
        )
    }

    /// Is the instance scheduled for or past deletion?
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, Status::Deleted | Status::Gone)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
            Status::Saving => "SAVING",
        };
        f.write_str(name)
    }
}

/// What the session knows about one managed instance.
#[derive(Clone)]
pub struct EntityEntry {
    status: Status,
    id: Value,
    entity_name: String,
    persister: Arc<dyn EntityPersister>,
    lock_mode: LockMode,
    loaded_state: Option<Vec<PropertyValue>>,
    deleted_state: Option<Vec<PropertyValue>>,
    version: Value,
    exists_in_database: bool,
    version_increment_disabled: bool,
}

impl EntityEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: Status,
        loaded_state: Option<Vec<PropertyValue>>,
        id: Value,
        version: Value,
        lock_mode: LockMode,
        exists_in_database: bool,
        persister: Arc<dyn EntityPersister>,
        version_increment_disabled: bool,
    ) -> Self {
        Self {
            status,
            id,
            entity_name: persister.entity_name().to_string(),
            persister,
            lock_mode,
            loaded_state,
            deleted_state: None,
            version,
            exists_in_database,
            version_increment_disabled,
        }
    }

    /// Lifecycle status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Identifier (a placeholder while an identity insert is pending).
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Concrete entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Persister of the concrete entity.
    pub fn persister(&self) -> &Arc<dyn EntityPersister> {
        &self.persister
    }

    /// Strongest lock held on the row.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Property values as last read from or written to the database.
    /// `None` when unknown (reattached without a select).
    pub fn loaded_state(&self) -> Option<&[PropertyValue]> {
        self.loaded_state.as_deref()
    }

    /// State captured at deletion time.
    pub fn deleted_state(&self) -> Option<&[PropertyValue]> {
        self.deleted_state.as_deref()
    }

    /// Version as last read from or written to the database.
    pub fn version(&self) -> &Value {
        &self.version
    }

    /// Has the row been written?
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Is the next update written without bumping the version?
    pub fn is_version_increment_disabled(&self) -> bool {
        self.version_increment_disabled
    }

    /// Is the instance read-only?
    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    /// May the instance be written by a flush?
    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, Status::Managed | Status::Saving) && self.persister.metadata().mutable
    }

    /// Should flush compare current state against the snapshot?
    pub fn requires_dirty_check(&self) -> bool {
        self.is_modifiable()
    }

    pub(crate) fn set_status(&mut self, status: Status) -> Result<()> {
        if !self.status.can_become(status) {
            return Err(Error::AssertionFailure(format!(
                "illegal status transition {} -> {} for {}#{}",
                self.status, status, self.entity_name, self.id
            )));
        }
        if status == Status::Deleted {
            self.loaded_state_for_deletion();
        }
        self.status = status;
        Ok(())
    }

    fn loaded_state_for_deletion(&mut self) {
        if self.deleted_state.is_none() {
            self.deleted_state.clone_from(&self.loaded_state);
        }
    }

    pub(crate) fn set_deleted_state(&mut self, state: Vec<PropertyValue>) {
        self.deleted_state = Some(state);
    }

    pub(crate) fn set_lock_mode(&mut self, lock_mode: LockMode) {
        self.lock_mode = lock_mode;
    }

    pub(crate) fn set_id(&mut self, id: Value) {
        self.id = id;
    }

    pub(crate) fn set_loaded_state(&mut self, state: Option<Vec<PropertyValue>>) {
        self.loaded_state = state;
    }

    pub(crate) fn set_version(&mut self, version: Value) {
        self.version = version;
    }

    /// Record a completed insert.
    pub(crate) fn post_insert(&mut self, id: Value) {
        self.id = id;
        self.exists_in_database = true;
        if self.status == Status::Saving {
            self.status = if self.persister.metadata().mutable {
                Status::Managed
            } else {
                Status::ReadOnly
            };
        }
    }

    /// Record a completed update: the written state becomes the snapshot.
    pub(crate) fn post_update(&mut self, entity: &EntityHandle, state: Vec<PropertyValue>, next_version: Value) {
        self.loaded_state = Some(state);
        if self.persister.is_versioned() {
            self.version = next_version.clone();
            entity.set_version(next_version);
        }
        self.version_increment_disabled = false;
    }

    /// Record a completed delete.
    pub(crate) fn post_delete(&mut self) {
        self.status = Status::Gone;
        self.exists_in_database = false;
    }

    /// Record a forced version increment.
    pub(crate) fn force_locked(&mut self, entity: &EntityHandle, next_version: Value) {
        self.version = next_version.clone();
        entity.set_version(next_version);
        self.lock_mode = LockMode::Force;
    }

    /// Switch between `Managed` and `ReadOnly`. Making an instance writable
    /// again re-snapshots its current state.
    pub(crate) fn set_read_only(&mut self, read_only: bool, entity: &EntityHandle) -> Result<()> {
        if read_only == self.is_read_only() {
            return Ok(());
        }
        match self.status {
            Status::Managed | Status::ReadOnly => {}
            other => {
                return Err(Error::Usage(format!(
                    "cannot change the read-only flag of {}#{} in status {other}",
                    self.entity_name, self.id
                )));
            }
        }
        if read_only {
            self.status = Status::ReadOnly;
        } else {
            if !self.persister.metadata().mutable {
                return Err(Error::Usage(format!(
                    "cannot make an immutable {} modifiable",
                    self.entity_name
                )));
            }
            self.status = Status::Managed;
            self.loaded_state = Some(entity.state()?);
        }
        Ok(())
    }
}

impl fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry")
            .field("entity", &self.entity_name)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("lock_mode", &self.lock_mode)
            .field("version", &self.version)
            .field("exists_in_database", &self.exists_in_database)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orm_core::{
        EntityMetadata, IdGeneration, LoadedRow, PropertyMetadata, RegionAccessStrategy,
        VersionType,
    };

    struct NullPersister(Arc<EntityMetadata>);

    impl EntityPersister for NullPersister {
        fn metadata(&self) -> &Arc<EntityMetadata> {
            &self.0
        }
        fn generate_identifier(&self) -> Result<Value> {
            Ok(Value::BigInt(1))
        }
        fn insert(&self, _: &Value, _: &[Value], _: &Value) -> Result<()> {
            Ok(())
        }
        fn insert_identity(&self, _: &[Value], _: &Value) -> Result<Value> {
            Ok(Value::BigInt(1))
        }
        fn update(&self, _: &Value, _: &[Value], _: &[usize], _: &Value, _: &Value) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _: &Value, _: &Value) -> Result<()> {
            Ok(())
        }
        fn load(&self, _: &Value, _: LockMode) -> Result<Option<LoadedRow>> {
            Ok(None)
        }
        fn lock(&self, _: &Value, _: &Value, _: LockMode) -> Result<()> {
            Ok(())
        }
        fn force_version_increment(&self, _: &Value, _: &Value) -> Result<Value> {
            Ok(Value::BigInt(2))
        }
        fn cache_access(&self) -> Option<Arc<dyn RegionAccessStrategy>> {
            None
        }
    }

    fn entry(status: Status, mutable: bool) -> (EntityEntry, EntityHandle) {
        let mut builder = EntityMetadata::new("Note")
            .identifier("id", IdGeneration::Assigned)
            .version("version", VersionType::Integer)
            .property(PropertyMetadata::basic("text"));
        if !mutable {
            builder = builder.immutable();
        }
        let meta = builder.build().unwrap();
        let entity = EntityHandle::with_id(&meta, 1_i64);
        let persister: Arc<dyn EntityPersister> = Arc::new(NullPersister(meta));
        let entry = EntityEntry::new(
            status,
            Some(entity.state().unwrap()),
            Value::BigInt(1),
            Value::BigInt(0),
            LockMode::None,
            true,
            persister,
            false,
        );
        (entry, entity)
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(Status::Saving.can_become(Status::Managed));
        assert!(Status::Managed.can_become(Status::ReadOnly));
        assert!(Status::ReadOnly.can_become(Status::Managed));
        assert!(Status::Managed.can_become(Status::Deleted));
        assert!(Status::Deleted.can_become(Status::Gone));
        assert!(!Status::Deleted.can_become(Status::Managed));
        assert!(!Status::Gone.can_become(Status::Deleted));
        assert!(!Status::Managed.can_become(Status::Saving));
    }

    #[test]
    fn test_set_status_rejects_resurrection() {
        let (mut entry, _) = entry(Status::Managed, true);
        entry.set_status(Status::Deleted).unwrap();
        assert!(entry.deleted_state().is_some());
        let err = entry.set_status(Status::Managed).unwrap_err();
        assert!(matches!(err, Error::AssertionFailure(_)));
    }

    #[test]
    fn test_post_insert_promotes_saving() {
        let (mut entry, _) = entry(Status::Saving, true);
        entry.post_insert(Value::BigInt(9));
        assert_eq!(entry.status(), Status::Managed);
        assert_eq!(entry.id(), &Value::BigInt(9));
        assert!(entry.exists_in_database());

        let (mut immutable, _) = entry_immutable();
        immutable.post_insert(Value::BigInt(1));
        assert_eq!(immutable.status(), Status::ReadOnly);
    }

    fn entry_immutable() -> (EntityEntry, EntityHandle) {
        entry(Status::Saving, false)
    }

    #[test]
    fn test_post_update_moves_version() {
        let (mut entry, entity) = entry(Status::Managed, true);
        entry.post_update(&entity, entity.state().unwrap(), Value::BigInt(1));
        assert_eq!(entry.version(), &Value::BigInt(1));
        assert_eq!(entity.version(), Value::BigInt(1));
    }

    #[test]
    fn test_read_only_toggle_resnapshots() {
        let (mut entry, entity) = entry(Status::Managed, true);
        entry.set_read_only(true, &entity).unwrap();
        assert!(entry.is_read_only());
        assert!(!entry.requires_dirty_check());

        entity.set("text", Value::from("changed")).unwrap();
        entry.set_read_only(false, &entity).unwrap();
        assert_eq!(entry.status(), Status::Managed);
        assert_eq!(
            entry.loaded_state().unwrap()[0].as_value(),
            Some(&Value::from("changed"))
        );
    }

    #[test]
    fn test_immutable_cannot_become_writable() {
        let (mut entry, entity) = entry(Status::ReadOnly, false);
        assert!(entry.set_read_only(false, &entity).is_err());
        assert!(!entry.is_modifiable());
    }

    #[test]
    fn test_force_locked() {
        let (mut entry, entity) = entry(Status::Managed, true);
        entry.force_locked(&entity, Value::BigInt(5));
        assert_eq!(entry.lock_mode(), LockMode::Force);
        assert_eq!(entity.version(), Value::BigInt(5));
    }
}
