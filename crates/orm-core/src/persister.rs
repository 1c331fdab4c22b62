//! Persister contracts.
//!
//! A persister executes the database side of one entity type or collection
//! role. The session never builds SQL: it hands persisters disassembled
//! state, where entity references are replaced by their identifiers,
//! collections by null and components by arrays of their nested values.

use crate::cache::RegionAccessStrategy;
use crate::collection::Element;
use crate::metadata::{CollectionMetadata, EntityMetadata};
use crate::object::{EntityHandle, PropertyValue};
use crate::{LockMode, Result, Value, VersionType};
use std::sync::Arc;

/// A row read by [`EntityPersister::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRow {
    /// Concrete entity name of the row (may be a subclass of the persister's entity).
    pub entity_name: String,
    /// Disassembled property values in metadata order.
    pub state: Vec<Value>,
    /// Current version, null when unversioned.
    pub version: Value,
}

/// Flatten property values into the form persisters and cache entries store.
pub fn disassemble(state: &[PropertyValue]) -> Vec<Value> {
    state.iter().map(disassemble_value).collect()
}

fn disassemble_value(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Value(v) => v.clone(),
        PropertyValue::Entity(Some(e)) => e.id(),
        PropertyValue::Entity(None)
        | PropertyValue::Collection(_)
        | PropertyValue::Component(None) => Value::Null,
        PropertyValue::Component(Some(nested)) => Value::Array(disassemble(nested)),
    }
}

/// Flatten collection elements.
pub fn disassemble_elements(elements: &[Element]) -> Vec<Value> {
    elements
        .iter()
        .map(|e| match e {
            Element::Value(v) => v.clone(),
            Element::Entity(entity) => entity.id(),
        })
        .collect()
}

/// Database operations for one entity type.
pub trait EntityPersister: Send + Sync {
    /// Mapping of the entity.
    fn metadata(&self) -> &Arc<EntityMetadata>;

    /// Hand out an identifier ahead of the insert (sequence generation).
    fn generate_identifier(&self) -> Result<Value>;

    /// Insert a row under a known identifier.
    fn insert(&self, id: &Value, state: &[Value], version: &Value) -> Result<()>;

    /// Insert a row and return the identifier the database generated.
    fn insert_identity(&self, state: &[Value], version: &Value) -> Result<Value>;

    /// Update a row. `dirty` lists the changed property indexes (all of them
    /// when unknown). Versioned rows must currently hold `old_version`.
    fn update(
        &self,
        id: &Value,
        state: &[Value],
        dirty: &[usize],
        old_version: &Value,
        new_version: &Value,
    ) -> Result<()>;

    /// Delete a row, checking `version` when versioned.
    fn delete(&self, id: &Value, version: &Value) -> Result<()>;

    /// Read a row, acquiring `lock_mode` where it is pessimistic.
    fn load(&self, id: &Value, lock_mode: LockMode) -> Result<Option<LoadedRow>>;

    /// Issue a database lock (or version check) for a row.
    fn lock(&self, id: &Value, version: &Value, lock_mode: LockMode) -> Result<()>;

    /// Bump the version of a row, returning the new version.
    fn force_version_increment(&self, id: &Value, current_version: &Value) -> Result<Value>;

    /// Cache access strategy for the entity's region, if cached.
    fn cache_access(&self) -> Option<Arc<dyn RegionAccessStrategy>>;

    /// Entity name.
    fn entity_name(&self) -> &str {
        &self.metadata().name
    }

    /// Is the entity cached in the second-level cache?
    fn has_cache(&self) -> bool {
        self.cache_access().is_some()
    }

    /// Is the entity versioned?
    fn is_versioned(&self) -> bool {
        self.metadata().is_versioned()
    }

    /// Version type, when versioned.
    fn version_type(&self) -> Option<VersionType> {
        self.metadata().version_type()
    }

    /// Create an empty instance with the given identifier.
    fn instantiate(&self, id: &Value) -> EntityHandle {
        EntityHandle::with_id(self.metadata(), id.clone())
    }

    /// Identifier of an instance.
    fn get_identifier(&self, entity: &EntityHandle) -> Value {
        entity.id()
    }

    /// Assign the identifier of an instance.
    fn set_identifier(&self, entity: &EntityHandle, id: &Value) {
        entity.set_id(id.clone());
    }

    /// Current property values of an instance.
    fn get_property_values(&self, entity: &EntityHandle) -> Result<Vec<PropertyValue>> {
        entity.state()
    }

    /// Replace the property values of an instance.
    fn set_property_values(&self, entity: &EntityHandle, values: Vec<PropertyValue>) -> Result<()> {
        entity.set_state(values)
    }

    /// Version of an instance, null when unversioned.
    fn get_version(&self, entity: &EntityHandle) -> Value {
        if self.is_versioned() {
            entity.version()
        } else {
            Value::Null
        }
    }
}

/// Database operations for one collection role.
pub trait CollectionPersister: Send + Sync {
    /// Mapping of the collection.
    fn metadata(&self) -> &Arc<CollectionMetadata>;

    /// Write every element of a collection that has no rows yet.
    fn recreate(&self, key: &Value, elements: &[Value]) -> Result<()>;

    /// Delete every row of a collection.
    fn remove(&self, key: &Value) -> Result<()>;

    /// Delete the rows of the given elements.
    fn delete_rows(&self, key: &Value, elements: &[Value]) -> Result<()>;

    /// Insert rows for the given elements.
    fn insert_rows(&self, key: &Value, elements: &[Value]) -> Result<()>;

    /// Read the elements owned by `key`.
    fn load(&self, key: &Value) -> Result<Vec<Value>>;

    /// Cache access strategy for the role's region, if cached.
    fn cache_access(&self) -> Option<Arc<dyn RegionAccessStrategy>>;

    /// Collection role.
    fn role(&self) -> &str {
        &self.metadata().role
    }

    /// Is the collection cached in the second-level cache?
    fn has_cache(&self) -> bool {
        self.cache_access().is_some()
    }

    /// Is the link owned by the other side?
    fn is_inverse(&self) -> bool {
        self.metadata().inverse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionHandle;
    use crate::metadata::PropertyMetadata;
    use crate::IdGeneration;

    #[test]
    fn test_disassemble_replaces_references() {
        let team_meta = EntityMetadata::new("Team").build().unwrap();
        let team = EntityHandle::with_id(&team_meta, 9_i64);
        let nicknames = CollectionHandle::new("Person.nicknames");
        let state = vec![
            PropertyValue::Value(Value::from("Ada")),
            PropertyValue::from(&team),
            PropertyValue::from(&nicknames),
            PropertyValue::from(vec![PropertyValue::Value(Value::from("Paris"))]),
            PropertyValue::Component(None),
        ];
        assert_eq!(
            disassemble(&state),
            vec![
                Value::from("Ada"),
                Value::BigInt(9),
                Value::Null,
                Value::Array(vec![Value::from("Paris")]),
                Value::Null,
            ]
        );
    }

    #[test]
    fn test_disassemble_elements() {
        let meta = EntityMetadata::new("Person")
            .identifier("id", IdGeneration::Sequence)
            .property(PropertyMetadata::basic("name"))
            .build()
            .unwrap();
        let person = EntityHandle::with_id(&meta, 3_i64);
        let elements = vec![Element::Value(Value::from("x")), Element::Entity(person)];
        assert_eq!(
            disassemble_elements(&elements),
            vec![Value::from("x"), Value::BigInt(3)]
        );
    }
}
