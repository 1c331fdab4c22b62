//! Collection persister over [`MemoryDatabase`].

use crate::database::{MemoryDatabase, Statement};
use orm_core::{
    CollectionMetadata, CollectionPersister, EntityMetadata, Error, PersisterError,
    PersisterErrorKind, RegionAccessStrategy, Result, Value,
};
use std::sync::Arc;

/// Stores collection rows as `(owner key, element)` pairs.
///
/// Inverse collections own no rows: they are read back by scanning the
/// element table for rows whose `mapped_by` column holds the owner key, and
/// every write is skipped.
pub struct MemoryCollectionPersister {
    metadata: Arc<CollectionMetadata>,
    element_metadata: Option<Arc<EntityMetadata>>,
    db: Arc<MemoryDatabase>,
    cache: Option<Arc<dyn RegionAccessStrategy>>,
}

impl MemoryCollectionPersister {
    /// Create a persister for `metadata`.
    pub fn new(metadata: Arc<CollectionMetadata>, db: Arc<MemoryDatabase>) -> Self {
        Self {
            metadata,
            element_metadata: None,
            db,
            cache: None,
        }
    }

    /// Element entity mapping, required to load inverse collections.
    #[must_use]
    pub fn with_element_metadata(mut self, element: Arc<EntityMetadata>) -> Self {
        self.element_metadata = Some(element);
        self
    }

    /// Cache collections through `access`.
    #[must_use]
    pub fn with_cache(mut self, access: Arc<dyn RegionAccessStrategy>) -> Self {
        self.cache = Some(access);
        self
    }

    fn owns_rows(&self) -> bool {
        !self.metadata.inverse
    }

    fn check_failure(&self, kind: &str) -> Result<()> {
        if self.db.lock().should_fail(kind, &self.metadata.role) {
            return Err(PersisterError::new(
                PersisterErrorKind::Update,
                self.metadata.owner.clone(),
                format!("injected {kind} failure on {}", self.metadata.role),
            )
            .into());
        }
        Ok(())
    }

    fn load_inverse(&self, key: &Value) -> Result<Vec<Value>> {
        let (Some(element), Some(mapped_by)) = (&self.element_metadata, &self.metadata.mapped_by)
        else {
            return Err(Error::Mapping(format!(
                "{}: inverse collection needs the element mapping to load",
                self.metadata.role
            )));
        };
        let index = element.property_index(mapped_by).ok_or_else(|| {
            Error::Mapping(format!(
                "{}: element {} has no property '{}'",
                self.metadata.role, element.name, mapped_by
            ))
        })?;
        let db = self.db.lock();
        let Some(rows) = db.tables.get(element.root_name()) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(_, row)| row.state.get(index).is_some_and(|v| v.same_identifier(key)))
            .map(|(id, _)| id.0.clone())
            .collect())
    }
}

impl CollectionPersister for MemoryCollectionPersister {
    fn metadata(&self) -> &Arc<CollectionMetadata> {
        &self.metadata
    }

    fn recreate(&self, key: &Value, elements: &[Value]) -> Result<()> {
        if !self.owns_rows() {
            return Ok(());
        }
        self.check_failure("collection-recreate")?;
        let mut db = self.db.lock();
        let rows = db.collections.entry(self.metadata.role.clone()).or_default();
        rows.extend(elements.iter().map(|e| (key.clone(), e.clone())));
        db.log.push(Statement::CollectionRecreate {
            role: self.metadata.role.clone(),
            key: key.clone(),
        });
        Ok(())
    }

    fn remove(&self, key: &Value) -> Result<()> {
        if !self.owns_rows() {
            return Ok(());
        }
        self.check_failure("collection-remove")?;
        let mut db = self.db.lock();
        if let Some(rows) = db.collections.get_mut(&self.metadata.role) {
            rows.retain(|(owner, _)| !owner.same_identifier(key));
        }
        db.log.push(Statement::CollectionRemove {
            role: self.metadata.role.clone(),
            key: key.clone(),
        });
        Ok(())
    }

    fn delete_rows(&self, key: &Value, elements: &[Value]) -> Result<()> {
        if !self.owns_rows() || elements.is_empty() {
            return Ok(());
        }
        self.check_failure("collection-delete-rows")?;
        let mut db = self.db.lock();
        if let Some(rows) = db.collections.get_mut(&self.metadata.role) {
            for element in elements {
                if let Some(index) = rows
                    .iter()
                    .position(|(owner, e)| owner.same_identifier(key) && e.same_identifier(element))
                {
                    rows.remove(index);
                }
            }
        }
        db.log.push(Statement::CollectionDeleteRows {
            role: self.metadata.role.clone(),
            key: key.clone(),
            count: elements.len(),
        });
        Ok(())
    }

    fn insert_rows(&self, key: &Value, elements: &[Value]) -> Result<()> {
        if !self.owns_rows() || elements.is_empty() {
            return Ok(());
        }
        self.check_failure("collection-insert-rows")?;
        let mut db = self.db.lock();
        let rows = db.collections.entry(self.metadata.role.clone()).or_default();
        rows.extend(elements.iter().map(|e| (key.clone(), e.clone())));
        db.log.push(Statement::CollectionInsertRows {
            role: self.metadata.role.clone(),
            key: key.clone(),
            count: elements.len(),
        });
        Ok(())
    }

    fn load(&self, key: &Value) -> Result<Vec<Value>> {
        self.db.lock().log.push(Statement::CollectionSelect {
            role: self.metadata.role.clone(),
            key: key.clone(),
        });
        if self.owns_rows() {
            Ok(self.db.collection_rows(&self.metadata.role, key))
        } else {
            self.load_inverse(key)
        }
    }

    fn cache_access(&self) -> Option<Arc<dyn RegionAccessStrategy>> {
        self.cache.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoredRow;
    use orm_core::{IdGeneration, PropertyMetadata};

    #[test]
    fn test_value_collection_rows() {
        let db = Arc::new(MemoryDatabase::new());
        let meta = CollectionMetadata::values("Person", "nicknames").build().unwrap();
        let persister = MemoryCollectionPersister::new(meta, Arc::clone(&db));
        let key = Value::BigInt(1);

        persister.recreate(&key, &[Value::from("a"), Value::from("b")]).unwrap();
        persister.insert_rows(&key, &[Value::from("c")]).unwrap();
        persister.delete_rows(&key, &[Value::from("a")]).unwrap();
        assert_eq!(persister.load(&key).unwrap(), vec![Value::from("b"), Value::from("c")]);
        assert!(persister.load(&Value::BigInt(2)).unwrap().is_empty());

        persister.remove(&key).unwrap();
        assert!(db.collection_rows("Person.nicknames", &key).is_empty());
        assert_eq!(db.count("collection-select"), 2);
    }

    #[test]
    fn test_inverse_collection_reads_element_table() {
        let db = Arc::new(MemoryDatabase::new());
        let person = EntityMetadata::new("Person")
            .identifier("id", IdGeneration::Identity)
            .property(PropertyMetadata::basic("name"))
            .property(PropertyMetadata::many_to_one("team", "Team"))
            .build()
            .unwrap();
        for (id, team) in [(1, 10), (2, 11), (3, 10)] {
            db.put_row(
                "Person",
                &Value::BigInt(id),
                StoredRow {
                    entity_name: "Person".to_string(),
                    state: vec![Value::Null, Value::BigInt(team)],
                    version: Value::Null,
                },
            );
        }
        let meta = CollectionMetadata::entities("Team", "members", "Person")
            .inverse("team")
            .build()
            .unwrap();
        let persister =
            MemoryCollectionPersister::new(meta, Arc::clone(&db)).with_element_metadata(person);

        assert!(persister.is_inverse());
        assert_eq!(
            persister.load(&Value::BigInt(10)).unwrap(),
            vec![Value::BigInt(1), Value::BigInt(3)]
        );
        persister.recreate(&Value::BigInt(10), &[Value::BigInt(2)]).unwrap();
        assert_eq!(db.count("collection-recreate"), 0);
    }
}
