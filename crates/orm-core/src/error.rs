//! Error types for persistence-context operations.

use crate::Value;
use std::fmt;

/// The primary error type for all session operations.
#[derive(Debug)]
pub enum Error {
    /// An operation was attempted on an instance whose entry is DELETED (or gone).
    ObjectDeleted(EntityErrorInfo),
    /// Optimistic version check failed: the row was updated or deleted by another transaction.
    StaleObjectState(EntityErrorInfo),
    /// The identifier resolved to a row of a different entity type.
    WrongClass(EntityErrorInfo),
    /// A transient instance was used where a persistent or detached one is required.
    TransientObject(String),
    /// A different instance with the same identifier is already managed by the session.
    NonUniqueObject(EntityErrorInfo),
    /// No row exists for the requested identifier.
    ObjectNotFound(EntityErrorInfo),
    /// A lazy proxy or collection was accessed without an owning session.
    LazyInitialization(String),
    /// A persister failed while executing a database operation.
    Persister(PersisterError),
    /// A second-level cache region failed.
    Cache(CacheError),
    /// The caller passed arguments the API does not accept (null entity, WRITE lock, closed session).
    Usage(String),
    /// Entity or collection metadata is inconsistent.
    Mapping(String),
    /// An internal invariant was violated.
    AssertionFailure(String),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Identifies the entity an error refers to.
#[derive(Debug, Clone)]
pub struct EntityErrorInfo {
    /// Entity name
    pub entity_name: String,
    /// Identifier, when known
    pub id: Option<Value>,
    /// Human-readable explanation
    pub message: String,
}

#[derive(Debug)]
pub struct PersisterError {
    pub kind: PersisterErrorKind,
    pub entity_name: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterErrorKind {
    /// Insert failed
    Insert,
    /// Update failed
    Update,
    /// Delete failed
    Delete,
    /// Row or collection load failed
    Load,
    /// Pessimistic lock could not be acquired
    Lock,
    /// Constraint violation (duplicate key, dangling foreign key)
    Constraint,
    /// Identifier generation failed
    IdentifierGeneration,
}

#[derive(Debug)]
pub struct CacheError {
    pub region: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EntityErrorInfo {
    /// Build error context for an entity.
    pub fn new(entity_name: impl Into<String>, id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            message: message.into(),
        }
    }
}

impl Error {
    /// Build an `ObjectDeleted` error.
    pub fn object_deleted(entity_name: &str, id: &Value, message: &str) -> Self {
        Error::ObjectDeleted(EntityErrorInfo::new(entity_name, Some(id.clone()), message))
    }

    /// Build a `StaleObjectState` error.
    pub fn stale_state(entity_name: &str, id: &Value) -> Self {
        Error::StaleObjectState(EntityErrorInfo::new(
            entity_name,
            Some(id.clone()),
            "row was updated or deleted by another transaction",
        ))
    }

    /// Build a `NonUniqueObject` error.
    pub fn non_unique(entity_name: &str, id: &Value) -> Self {
        Error::NonUniqueObject(EntityErrorInfo::new(
            entity_name,
            Some(id.clone()),
            "a different object with the same identifier value was already associated with the session",
        ))
    }

    /// Build an `ObjectNotFound` error.
    pub fn not_found(entity_name: &str, id: &Value) -> Self {
        Error::ObjectNotFound(EntityErrorInfo::new(
            entity_name,
            Some(id.clone()),
            "no row with the given identifier exists",
        ))
    }

    /// Is this an optimistic-concurrency failure the caller may retry in a new transaction?
    pub fn is_optimistic_failure(&self) -> bool {
        matches!(self, Error::StaleObjectState(_))
    }

    /// Is this a programmer/usage error?
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Error::Usage(_) | Error::LazyInitialization(_))
    }

    /// Is this a lifecycle precondition violation?
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            Error::ObjectDeleted(_)
                | Error::TransientObject(_)
                | Error::NonUniqueObject(_)
                | Error::WrongClass(_)
                | Error::ObjectNotFound(_)
        )
    }

    /// Get the entity name this error refers to, if any.
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Error::ObjectDeleted(info)
            | Error::StaleObjectState(info)
            | Error::WrongClass(info)
            | Error::NonUniqueObject(info)
            | Error::ObjectNotFound(info) => Some(&info.entity_name),
            Error::Persister(e) => Some(&e.entity_name),
            _ => None,
        }
    }
}

impl PersisterError {
    /// Create a persister error without an underlying cause.
    pub fn new(
        kind: PersisterErrorKind,
        entity_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_name: entity_name.into(),
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for EntityErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}: [{}#{}]", self.message, self.entity_name, id),
            None => write!(f, "{}: [{}]", self.message, self.entity_name),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectDeleted(e) => write!(f, "Object deleted: {}", e),
            Error::StaleObjectState(e) => write!(f, "Stale object state: {}", e),
            Error::WrongClass(e) => write!(f, "Wrong class: {}", e),
            Error::TransientObject(msg) => write!(f, "Transient object: {}", msg),
            Error::NonUniqueObject(e) => write!(f, "Non-unique object: {}", e),
            Error::ObjectNotFound(e) => write!(f, "Object not found: {}", e),
            Error::LazyInitialization(msg) => write!(f, "Lazy initialization error: {}", msg),
            Error::Persister(e) => write!(f, "Persister error ({}): {}", e.entity_name, e.message),
            Error::Cache(e) => write!(f, "Cache error in region '{}': {}", e.region, e.message),
            Error::Usage(msg) => write!(f, "Usage error: {}", msg),
            Error::Mapping(msg) => write!(f, "Mapping error: {}", msg),
            Error::AssertionFailure(msg) => write!(f, "Assertion failure: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persister(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Cache(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for PersisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<PersisterError> for Error {
    fn from(err: PersisterError) -> Self {
        Error::Persister(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;
