//! Persistent collection wrappers.

use crate::object::EntityHandle;
use crate::{Error, Result, Value};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One collection element.
#[derive(Clone)]
pub enum Element {
    /// A column value.
    Value(Value),
    /// An entity reference.
    Entity(EntityHandle),
}

impl Element {
    /// Referenced entity, for entity elements.
    pub fn as_entity(&self) -> Option<&EntityHandle> {
        match self {
            Element::Entity(e) => Some(e),
            Element::Value(_) => None,
        }
    }

    /// Same element? Values compare by value, entities by instance.
    pub fn same_as(&self, other: &Element) -> bool {
        match (self, other) {
            (Element::Value(a), Element::Value(b)) => a == b,
            (Element::Entity(a), Element::Entity(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Value(v) => write!(f, "{v:?}"),
            Element::Entity(e) => write!(f, "{e:?}"),
        }
    }
}

impl From<Value> for Element {
    fn from(v: Value) -> Self {
        Element::Value(v)
    }
}

impl From<&EntityHandle> for Element {
    fn from(e: &EntityHandle) -> Self {
        Element::Entity(e.clone())
    }
}

/// Collection state shared between the owner and the persistence context.
pub struct PersistentCollection {
    role: String,
    key: Value,
    elements: Vec<Element>,
    initialized: bool,
    dirty: bool,
    snapshot: Option<Vec<Element>>,
}

impl PersistentCollection {
    /// Collection role (`Owner.property`).
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Owner key the collection was loaded or saved under.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Elements currently in memory (empty when uninitialized).
    pub fn loaded_elements(&self) -> &[Element] {
        &self.elements
    }
}

/// Shared handle to a persistent collection.
#[derive(Clone)]
pub struct CollectionHandle(Arc<RwLock<PersistentCollection>>);

impl CollectionHandle {
    /// Create a new, empty, initialized collection for `role`.
    pub fn new(role: impl Into<String>) -> Self {
        Self::with_elements(role, Vec::new())
    }

    /// Create a new initialized collection holding `elements`.
    pub fn with_elements(role: impl Into<String>, elements: Vec<Element>) -> Self {
        Self(Arc::new(RwLock::new(PersistentCollection {
            role: role.into(),
            key: Value::Null,
            elements,
            initialized: true,
            dirty: false,
            snapshot: None,
        })))
    }

    /// Create an uninitialized wrapper for the collection owned by `key`.
    pub fn uninitialized(role: impl Into<String>, key: Value) -> Self {
        Self(Arc::new(RwLock::new(PersistentCollection {
            role: role.into(),
            key,
            elements: Vec::new(),
            initialized: false,
            dirty: false,
            snapshot: None,
        })))
    }

    /// Read access; a poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, PersistentCollection> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, PersistentCollection> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Do both handles point at the same collection?
    pub fn ptr_eq(&self, other: &CollectionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity of the collection.
    pub fn object_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Collection role.
    pub fn role(&self) -> String {
        self.read().role.clone()
    }

    /// Owner key.
    pub fn key(&self) -> Value {
        self.read().key.clone()
    }

    /// Record the owner key (done when the collection is attached).
    pub fn set_key(&self, key: Value) {
        self.write().key = key;
    }

    /// Have the elements been loaded?
    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Has the collection been mutated since the last snapshot?
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    /// Flag the collection as mutated.
    pub fn mark_dirty(&self) {
        self.write().dirty = true;
    }

    /// Clear the mutation flag.
    pub fn clear_dirty(&self) {
        self.write().dirty = false;
    }

    fn ensure_initialized(guard: &PersistentCollection) -> Result<()> {
        if guard.initialized {
            Ok(())
        } else {
            Err(Error::LazyInitialization(format!(
                "failed to lazily initialize a collection of role: {}, no session",
                guard.role
            )))
        }
    }

    /// Copy of the elements. Fails when the collection is uninitialized.
    pub fn elements(&self) -> Result<Vec<Element>> {
        let guard = self.read();
        Self::ensure_initialized(&guard)?;
        Ok(guard.elements.clone())
    }

    /// Copy of whatever elements are in memory, loaded or not.
    pub fn loaded_elements(&self) -> Vec<Element> {
        self.read().elements.clone()
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        let guard = self.read();
        Self::ensure_initialized(&guard)?;
        Ok(guard.elements.len())
    }

    /// Is the collection empty?
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Does the collection contain `element`?
    pub fn contains(&self, element: &Element) -> Result<bool> {
        let guard = self.read();
        Self::ensure_initialized(&guard)?;
        Ok(guard.elements.iter().any(|e| e.same_as(element)))
    }

    /// Append an element.
    pub fn add(&self, element: impl Into<Element>) -> Result<()> {
        let mut guard = self.write();
        Self::ensure_initialized(&guard)?;
        guard.elements.push(element.into());
        guard.dirty = true;
        Ok(())
    }

    /// Remove the first matching element. Returns whether one was removed.
    pub fn remove(&self, element: &Element) -> Result<bool> {
        let mut guard = self.write();
        Self::ensure_initialized(&guard)?;
        match guard.elements.iter().position(|e| e.same_as(element)) {
            Some(index) => {
                guard.elements.remove(index);
                guard.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.write();
        Self::ensure_initialized(&guard)?;
        if !guard.elements.is_empty() {
            guard.elements.clear();
            guard.dirty = true;
        }
        Ok(())
    }

    /// Replace the contents, marking the collection dirty.
    pub fn replace_elements(&self, elements: Vec<Element>) {
        let mut guard = self.write();
        guard.elements = elements;
        guard.initialized = true;
        guard.dirty = true;
    }

    /// Install elements read from the database or the cache.
    pub fn inject_loaded(&self, elements: Vec<Element>) {
        let mut guard = self.write();
        guard.snapshot = Some(elements.clone());
        guard.elements = elements;
        guard.initialized = true;
        guard.dirty = false;
    }

    /// Elements as of the last load or flush, carried with the collection
    /// so it can be reattached to a later session.
    pub fn stored_snapshot(&self) -> Option<Vec<Element>> {
        self.read().snapshot.clone()
    }

    /// Record the persistent state after a flush.
    pub fn set_snapshot(&self, key: Value, snapshot: Option<Vec<Element>>) {
        let mut guard = self.write();
        guard.key = key;
        guard.snapshot = snapshot;
        guard.dirty = false;
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.read();
        if guard.initialized {
            write!(f, "{}#{}[{} elements]", guard.role, guard.key, guard.elements.len())
        } else {
            write!(f, "{}#{}[uninitialized]", guard.role, guard.key)
        }
    }
}
