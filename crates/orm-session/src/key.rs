//! Identity-map keys.

use orm_core::{EntityMetadata, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key of one logical row: hierarchy root name plus identifier.
///
/// Subclasses share their root's key space, so an `Employee` and a
/// `Person` with the same id are the same row.
#[derive(Clone)]
pub struct EntityKey {
    root_name: String,
    id: Value,
    hash: u64,
}

impl EntityKey {
    /// Key for `id` in the identifier space rooted at `root_name`.
    pub fn new(root_name: impl Into<String>, id: Value) -> Self {
        let root_name = root_name.into();
        let mut hasher = DefaultHasher::new();
        root_name.hash(&mut hasher);
        id.hash_into(&mut hasher);
        Self {
            root_name,
            id,
            hash: hasher.finish(),
        }
    }

    /// Key for `id` of an instance described by `metadata`.
    pub fn for_entity(metadata: &EntityMetadata, id: Value) -> Self {
        Self::new(metadata.root_name(), id)
    }

    /// Hierarchy root entity name.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Identifier.
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.root_name == other.root_name
            && self.id.same_identifier(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey[{}#{}]", self.root_name, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root_name, self.id)
    }
}

/// Key of one collection: role plus owner key.
#[derive(Clone)]
pub struct CollectionKey {
    role: String,
    key: Value,
    hash: u64,
}

impl CollectionKey {
    /// Key of the `role` collection owned by `key`.
    pub fn new(role: impl Into<String>, key: Value) -> Self {
        let role = role.into();
        let mut hasher = DefaultHasher::new();
        role.hash(&mut hasher);
        key.hash_into(&mut hasher);
        Self {
            role,
            key,
            hash: hasher.finish(),
        }
    }

    /// Collection role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Owner key.
    pub fn key(&self) -> &Value {
        &self.key
    }
}

impl PartialEq for CollectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.role == other.role && self.key.same_identifier(&other.key)
    }
}

impl Eq for CollectionKey {}

impl Hash for CollectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionKey[{}#{}]", self.role, self.key)
    }
}
