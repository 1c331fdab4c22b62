//! Entity persister over [`MemoryDatabase`].

use crate::database::{MemoryDatabase, Statement, StoredRow};
use orm_core::{
    EntityMetadata, EntityPersister, Error, IdGeneration, LoadedRow, LockMode, PersisterError,
    PersisterErrorKind, RegionAccessStrategy, Result, Value,
};
use std::sync::Arc;

/// Executes entity operations against an in-memory table named after the
/// hierarchy root.
pub struct MemoryEntityPersister {
    metadata: Arc<EntityMetadata>,
    db: Arc<MemoryDatabase>,
    cache: Option<Arc<dyn RegionAccessStrategy>>,
}

impl MemoryEntityPersister {
    /// Create a persister for `metadata`.
    pub fn new(metadata: Arc<EntityMetadata>, db: Arc<MemoryDatabase>) -> Self {
        Self {
            metadata,
            db,
            cache: None,
        }
    }

    /// Cache instances through `access`.
    #[must_use]
    pub fn with_cache(mut self, access: Arc<dyn RegionAccessStrategy>) -> Self {
        self.cache = Some(access);
        self
    }

    fn table(&self) -> &str {
        self.metadata.root_name()
    }

    fn error(&self, kind: PersisterErrorKind, message: impl Into<String>) -> Error {
        PersisterError::new(kind, self.metadata.name.clone(), message).into()
    }

    fn check_failure(&self, kind: &str, error_kind: PersisterErrorKind) -> Result<()> {
        if self.db.lock().should_fail(kind, &self.metadata.name) {
            return Err(self.error(error_kind, format!("injected {kind} failure")));
        }
        Ok(())
    }

    fn version_matches(&self, stored: &Value, expected: &Value) -> bool {
        match self.metadata.version_type() {
            Some(version_type) => version_type.is_equal(stored, expected),
            None => true,
        }
    }

    fn store(&self, id: &Value, state: &[Value], version: &Value) -> Result<()> {
        let mut db = self.db.lock();
        if db.row(self.table(), id).is_some() {
            return Err(self.error(
                PersisterErrorKind::Constraint,
                format!("duplicate key {id} in {}", self.table()),
            ));
        }
        db.put(
            self.table(),
            id,
            StoredRow {
                entity_name: self.metadata.name.clone(),
                state: state.to_vec(),
                version: version.clone(),
            },
        );
        db.log.push(Statement::Insert {
            entity: self.metadata.name.clone(),
            id: id.clone(),
        });
        Ok(())
    }
}

impl EntityPersister for MemoryEntityPersister {
    fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    fn generate_identifier(&self) -> Result<Value> {
        match self.metadata.id_generation {
            IdGeneration::Sequence | IdGeneration::Identity => {
                Ok(Value::BigInt(self.db.lock().next_id(self.table())))
            }
            IdGeneration::Assigned => Err(self.error(
                PersisterErrorKind::IdentifierGeneration,
                "identifiers of this entity must be assigned before saving",
            )),
        }
    }

    fn insert(&self, id: &Value, state: &[Value], version: &Value) -> Result<()> {
        self.check_failure("insert", PersisterErrorKind::Insert)?;
        tracing::trace!(entity = %self.metadata.name, id = %id, "memory insert");
        self.store(id, state, version)
    }

    fn insert_identity(&self, state: &[Value], version: &Value) -> Result<Value> {
        self.check_failure("insert", PersisterErrorKind::Insert)?;
        let id = Value::BigInt(self.db.lock().next_id(self.table()));
        tracing::trace!(entity = %self.metadata.name, id = %id, "memory identity insert");
        self.store(&id, state, version)?;
        Ok(id)
    }

    fn update(
        &self,
        id: &Value,
        state: &[Value],
        dirty: &[usize],
        old_version: &Value,
        new_version: &Value,
    ) -> Result<()> {
        self.check_failure("update", PersisterErrorKind::Update)?;
        let versioned = self.metadata.is_versioned();
        let mut db = self.db.lock();
        let table = self.table().to_string();
        let Some(row) = db.row_mut(&table, id) else {
            return Err(Error::stale_state(&self.metadata.name, id));
        };
        if versioned && !self.version_matches(&row.version, old_version) {
            return Err(Error::stale_state(&self.metadata.name, id));
        }
        if dirty.is_empty() || dirty.len() == state.len() || row.state.len() != state.len() {
            row.state = state.to_vec();
        } else {
            for &index in dirty {
                if let (Some(slot), Some(value)) = (row.state.get_mut(index), state.get(index)) {
                    *slot = value.clone();
                }
            }
        }
        if versioned {
            row.version = new_version.clone();
        }
        db.log.push(Statement::Update {
            entity: self.metadata.name.clone(),
            id: id.clone(),
        });
        Ok(())
    }

    fn delete(&self, id: &Value, version: &Value) -> Result<()> {
        self.check_failure("delete", PersisterErrorKind::Delete)?;
        let mut db = self.db.lock();
        let table = self.table().to_string();
        let matches = match db.row(&table, id) {
            Some(row) => !self.metadata.is_versioned() || self.version_matches(&row.version, version),
            None => false,
        };
        if !matches {
            return Err(Error::stale_state(&self.metadata.name, id));
        }
        db.remove(&table, id);
        db.log.push(Statement::Delete {
            entity: self.metadata.name.clone(),
            id: id.clone(),
        });
        Ok(())
    }

    fn load(&self, id: &Value, lock_mode: LockMode) -> Result<Option<LoadedRow>> {
        self.check_failure("select", PersisterErrorKind::Load)?;
        let mut db = self.db.lock();
        db.log.push(Statement::Select {
            entity: self.metadata.name.clone(),
            id: id.clone(),
        });
        if lock_mode.greater_than(LockMode::Read) && !lock_mode.forces_version_increment() {
            db.log.push(Statement::Lock {
                entity: self.metadata.name.clone(),
                id: id.clone(),
                mode: lock_mode,
            });
        }
        Ok(db.row(self.table(), id).map(|row| LoadedRow {
            entity_name: row.entity_name.clone(),
            state: row.state.clone(),
            version: row.version.clone(),
        }))
    }

    fn lock(&self, id: &Value, version: &Value, lock_mode: LockMode) -> Result<()> {
        self.check_failure("lock", PersisterErrorKind::Lock)?;
        let mut db = self.db.lock();
        let current = db.row(self.table(), id).map(|row| row.version.clone());
        match current {
            Some(stored) if !self.metadata.is_versioned() || self.version_matches(&stored, version) => {
                db.log.push(Statement::Lock {
                    entity: self.metadata.name.clone(),
                    id: id.clone(),
                    mode: lock_mode,
                });
                Ok(())
            }
            _ => Err(Error::stale_state(&self.metadata.name, id)),
        }
    }

    fn force_version_increment(&self, id: &Value, current_version: &Value) -> Result<Value> {
        self.check_failure("increment-version", PersisterErrorKind::Update)?;
        let Some(version_type) = self.metadata.version_type() else {
            return Err(Error::AssertionFailure(format!(
                "{} is not versioned; cannot force a version increment",
                self.metadata.name
            )));
        };
        let next = version_type.next(current_version)?;
        let mut db = self.db.lock();
        let table = self.table().to_string();
        match db.row_mut(&table, id) {
            Some(row) if version_type.is_equal(&row.version, current_version) => {
                row.version = next.clone();
            }
            _ => return Err(Error::stale_state(&self.metadata.name, id)),
        }
        db.log.push(Statement::IncrementVersion {
            entity: self.metadata.name.clone(),
            id: id.clone(),
        });
        Ok(next)
    }

    fn cache_access(&self) -> Option<Arc<dyn RegionAccessStrategy>> {
        self.cache.clone()
    }
}
