//! Dynamic entity instances and lazy proxies.
//!
//! Entities are shared, mutable objects: the application, the persistence
//! context and other entities all hold [`EntityHandle`]s to the same
//! instance. Identity is pointer identity of the handle, which is what the
//! identity map and the merge copy cache key on.

use crate::collection::CollectionHandle;
use crate::metadata::{EntityMetadata, PropertyKind, PropertyMetadata};
use crate::{Error, Result, Value};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Current value of one property.
#[derive(Clone)]
pub enum PropertyValue {
    /// Column value.
    Value(Value),
    /// To-one association.
    Entity(Option<EntityHandle>),
    /// Collection association.
    Collection(Option<CollectionHandle>),
    /// Embedded component, in the component's property order.
    Component(Option<Vec<PropertyValue>>),
}

impl PropertyValue {
    /// The null value appropriate for a property kind.
    pub fn null_for(kind: &PropertyKind) -> Self {
        match kind {
            PropertyKind::Basic => PropertyValue::Value(Value::Null),
            PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. } => {
                PropertyValue::Entity(None)
            }
            PropertyKind::Collection { .. } => PropertyValue::Collection(None),
            PropertyKind::Component { .. } => PropertyValue::Component(None),
        }
    }

    /// Is this value null?
    pub fn is_null(&self) -> bool {
        match self {
            PropertyValue::Value(v) => v.is_null(),
            PropertyValue::Entity(e) => e.is_none(),
            PropertyValue::Collection(c) => c.is_none(),
            PropertyValue::Component(c) => c.is_none(),
        }
    }

    /// Column value, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Referenced entity, if this is a non-null to-one association.
    pub fn as_entity(&self) -> Option<&EntityHandle> {
        match self {
            PropertyValue::Entity(Some(e)) => Some(e),
            _ => None,
        }
    }

    /// Collection, if this is a non-null collection association.
    pub fn as_collection(&self) -> Option<&CollectionHandle> {
        match self {
            PropertyValue::Collection(Some(c)) => Some(c),
            _ => None,
        }
    }

    /// Nested values, if this is a non-null component.
    pub fn as_component(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::Component(Some(values)) => Some(values),
            _ => None,
        }
    }

    /// Does this value fit a property of `kind`?
    pub fn matches_kind(&self, kind: &PropertyKind) -> bool {
        match (self, kind) {
            (PropertyValue::Value(_), PropertyKind::Basic)
            | (
                PropertyValue::Entity(_),
                PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. },
            )
            | (PropertyValue::Collection(_), PropertyKind::Collection { .. }) => true,
            (PropertyValue::Component(None), PropertyKind::Component { .. }) => true,
            (PropertyValue::Component(Some(values)), PropertyKind::Component { properties }) => {
                values.len() == properties.len()
                    && values
                        .iter()
                        .zip(properties)
                        .all(|(v, p)| v.matches_kind(&p.kind))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Value(v) => write!(f, "{v:?}"),
            PropertyValue::Entity(None) | PropertyValue::Collection(None) => write!(f, "null"),
            PropertyValue::Entity(Some(e)) => write!(f, "{e:?}"),
            PropertyValue::Collection(Some(c)) => write!(f, "{c:?}"),
            PropertyValue::Component(None) => write!(f, "component(null)"),
            PropertyValue::Component(Some(values)) => f.debug_list().entries(values).finish(),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Value(v)
    }
}

impl From<&EntityHandle> for PropertyValue {
    fn from(e: &EntityHandle) -> Self {
        PropertyValue::Entity(Some(e.clone()))
    }
}

impl From<Option<EntityHandle>> for PropertyValue {
    fn from(e: Option<EntityHandle>) -> Self {
        PropertyValue::Entity(e)
    }
}

impl From<&CollectionHandle> for PropertyValue {
    fn from(c: &CollectionHandle) -> Self {
        PropertyValue::Collection(Some(c.clone()))
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(values: Vec<PropertyValue>) -> Self {
        PropertyValue::Component(Some(values))
    }
}

/// Proxy bookkeeping: the proxied identifier is the object's own `id`.
#[derive(Debug, Clone, Default)]
pub struct LazyInitializer {
    target: Option<EntityHandle>,
    read_only: Option<bool>,
}

/// One entity instance (or a proxy standing in for one).
pub struct EntityObject {
    metadata: Arc<EntityMetadata>,
    id: Value,
    version: Value,
    state: Vec<PropertyValue>,
    lazy: Option<LazyInitializer>,
    modified: bool,
}

impl EntityObject {
    /// Entity metadata.
    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    /// Identifier value (null while transient).
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Version value (null when unversioned or unsaved).
    pub fn version(&self) -> &Value {
        &self.version
    }

    /// Property values in metadata order. Empty for proxies.
    pub fn state(&self) -> &[PropertyValue] {
        &self.state
    }
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityHandle(Arc<RwLock<EntityObject>>);

fn lazy_error(name: &str, id: &Value) -> Error {
    Error::LazyInitialization(format!(
        "could not initialize proxy [{name}#{id}] - no session"
    ))
}

impl EntityHandle {
    /// Create a transient instance with every property null.
    pub fn new(metadata: &Arc<EntityMetadata>) -> Self {
        let state = metadata
            .properties
            .iter()
            .map(|p| PropertyValue::null_for(&p.kind))
            .collect();
        Self(Arc::new(RwLock::new(EntityObject {
            metadata: Arc::clone(metadata),
            id: Value::Null,
            version: Value::Null,
            state,
            lazy: None,
            modified: false,
        })))
    }

    /// Create an instance with the given identifier.
    pub fn with_id(metadata: &Arc<EntityMetadata>, id: impl Into<Value>) -> Self {
        let handle = Self::new(metadata);
        handle.write().id = id.into();
        handle
    }

    /// Create an uninitialized proxy for `id`.
    pub fn new_proxy(metadata: &Arc<EntityMetadata>, id: Value) -> Self {
        Self(Arc::new(RwLock::new(EntityObject {
            metadata: Arc::clone(metadata),
            id,
            version: Value::Null,
            state: Vec::new(),
            lazy: Some(LazyInitializer::default()),
            modified: false,
        })))
    }

    /// Read access; a poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityObject> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityObject> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity of the instance.
    pub fn object_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Entity metadata.
    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.read().metadata)
    }

    /// Entity name.
    pub fn entity_name(&self) -> String {
        self.read().metadata.name.clone()
    }

    /// Identifier (for proxies, the proxied identifier).
    pub fn id(&self) -> Value {
        self.read().id.clone()
    }

    /// Set the identifier.
    pub fn set_id(&self, id: impl Into<Value>) {
        self.write().id = id.into();
    }

    /// Version value. For proxies, the target's version when initialized.
    pub fn version(&self) -> Value {
        match self.implementation() {
            Some(target) if !target.ptr_eq(self) => target.version(),
            _ => self.read().version.clone(),
        }
    }

    /// Set the version value.
    pub fn set_version(&self, version: impl Into<Value>) {
        self.write().version = version.into();
    }

    /// Is this handle a proxy?
    pub fn is_proxy(&self) -> bool {
        self.read().lazy.is_some()
    }

    /// Is this a proxy whose target has not been loaded?
    pub fn is_uninitialized(&self) -> bool {
        self.read()
            .lazy
            .as_ref()
            .is_some_and(|lazy| lazy.target.is_none())
    }

    /// The real instance: `self` for instances, the target for initialized proxies.
    pub fn implementation(&self) -> Option<EntityHandle> {
        match &self.read().lazy {
            None => Some(self.clone()),
            Some(lazy) => lazy.target.clone(),
        }
    }

    /// Connect a proxy to its loaded target.
    pub fn set_proxy_target(&self, target: &EntityHandle) -> Result<()> {
        let mut guard = self.write();
        match guard.lazy.as_mut() {
            Some(lazy) => {
                lazy.target = Some(target.clone());
                Ok(())
            }
            None => Err(Error::AssertionFailure(
                "attempted to set the target of an entity that is not a proxy".to_string(),
            )),
        }
    }

    /// Read-only flag recorded on a proxy.
    pub fn proxy_read_only(&self) -> Option<bool> {
        self.read().lazy.as_ref().and_then(|lazy| lazy.read_only)
    }

    /// Record the read-only flag on a proxy (no-op for instances).
    pub fn set_proxy_read_only(&self, read_only: bool) {
        if let Some(lazy) = self.write().lazy.as_mut() {
            lazy.read_only = Some(read_only);
        }
    }

    fn resolved(&self) -> Result<EntityHandle> {
        self.implementation().ok_or_else(|| {
            let guard = self.read();
            lazy_error(&guard.metadata.name, &guard.id)
        })
    }

    fn property_slot(metadata: &EntityMetadata, name: &str) -> Result<usize> {
        metadata.property_index(name).ok_or_else(|| {
            Error::Usage(format!("{} has no property '{}'", metadata.name, name))
        })
    }

    /// Current value of a property.
    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        let target = self.resolved()?;
        let guard = target.read();
        let index = Self::property_slot(&guard.metadata, name)?;
        Ok(guard.state[index].clone())
    }

    /// Set a property and mark the instance modified.
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        let target = self.resolved()?;
        let mut guard = target.write();
        let index = Self::property_slot(&guard.metadata, name)?;
        let property: &PropertyMetadata = &guard.metadata.properties[index];
        if !value.matches_kind(&property.kind) {
            return Err(Error::Usage(format!(
                "value {:?} does not fit property {}.{}",
                value, guard.metadata.name, name
            )));
        }
        guard.state[index] = value;
        guard.modified = true;
        Ok(())
    }

    /// Column value of a basic property.
    pub fn value(&self, name: &str) -> Result<Value> {
        match self.get(name)? {
            PropertyValue::Value(v) => Ok(v),
            other => Err(Error::Usage(format!(
                "property '{name}' is not a column value: {other:?}"
            ))),
        }
    }

    /// Target of a to-one association.
    pub fn entity(&self, name: &str) -> Result<Option<EntityHandle>> {
        match self.get(name)? {
            PropertyValue::Entity(e) => Ok(e),
            other => Err(Error::Usage(format!(
                "property '{name}' is not an entity reference: {other:?}"
            ))),
        }
    }

    /// Collection held by a collection property.
    pub fn collection(&self, name: &str) -> Result<Option<CollectionHandle>> {
        match self.get(name)? {
            PropertyValue::Collection(c) => Ok(c),
            other => Err(Error::Usage(format!(
                "property '{name}' is not a collection: {other:?}"
            ))),
        }
    }

    /// Copy of all property values in metadata order.
    pub fn state(&self) -> Result<Vec<PropertyValue>> {
        let target = self.resolved()?;
        let guard = target.read();
        Ok(guard.state.clone())
    }

    /// Replace all property values without marking the instance modified.
    pub fn set_state(&self, state: Vec<PropertyValue>) -> Result<()> {
        let target = self.resolved()?;
        let mut guard = target.write();
        if state.len() != guard.metadata.properties.len() {
            return Err(Error::AssertionFailure(format!(
                "{}: expected {} property values, got {}",
                guard.metadata.name,
                guard.metadata.properties.len(),
                state.len()
            )));
        }
        guard.state = state;
        Ok(())
    }

    /// Replace one property value by index without marking the instance modified.
    pub fn set_state_at(&self, index: usize, value: PropertyValue) -> Result<()> {
        let target = self.resolved()?;
        let mut guard = target.write();
        let len = guard.state.len();
        let slot = guard.state.get_mut(index).ok_or_else(|| {
            Error::AssertionFailure(format!("property index {index} out of range ({len})"))
        })?;
        *slot = value;
        Ok(())
    }

    /// Has a setter run since the last flush?
    pub fn is_modified(&self) -> bool {
        self.implementation()
            .is_some_and(|target| target.read().modified)
    }

    /// Flag the instance as modified.
    pub fn mark_modified(&self) {
        if let Some(target) = self.implementation() {
            target.write().modified = true;
        }
    }

    /// Clear the modification flag.
    pub fn clear_modified(&self) {
        if let Some(target) = self.implementation() {
            target.write().modified = false;
        }
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only name and id: state may contain cycles.
        let guard = self.read();
        if guard.lazy.is_some() {
            write!(f, "{}#{}(proxy)", guard.metadata.name, guard.id)
        } else {
            write!(f, "{}#{}", guard.metadata.name, guard.id)
        }
    }
}
