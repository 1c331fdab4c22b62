//! Second-level cache contract.
//!
//! The session talks to cache regions only through [`RegionAccessStrategy`].
//! Writes that could race with another session's read are bracketed by a
//! soft lock: the item is locked before the database write and unlocked (or
//! replaced) only after the transaction completes.

use crate::{Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamp units per millisecond.
pub const ONE_MS: u64 = 1 << 12;

/// Default soft-lock lifetime.
pub const SOFT_LOCK_TIMEOUT: u64 = 60_000 * ONE_MS;

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Process-wide source of strictly increasing cache timestamps
/// (milliseconds shifted left by 12).
///
/// Sessions and regions draw from the same sequence, so a session opened
/// after an item was cached always sees a later timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamper;

impl Timestamper {
    /// Next timestamp; never repeats.
    pub fn next() -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX >> 12));
        let candidate = millis << 12;
        let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last + 1);
            match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

// ============================================================================
// Keys, entries and locks
// ============================================================================

/// What a cache key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKeyKind {
    Entity,
    Collection,
}

/// Key of a cached entity (root name + id) or collection (role + owner key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    kind: CacheKeyKind,
    name: String,
    id: Value,
    hash: u64,
}

impl CacheKey {
    fn build(kind: CacheKeyKind, name: String, id: Value) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        kind.hash(&mut hasher);
        name.hash(&mut hasher);
        id.hash_into(&mut hasher);
        Self {
            kind,
            name,
            id,
            hash: hasher.finish(),
        }
    }

    /// Key for an entity, named by its hierarchy root.
    pub fn entity(root_entity: impl Into<String>, id: Value) -> Self {
        Self::build(CacheKeyKind::Entity, root_entity.into(), id)
    }

    /// Key for a collection, named by its role.
    pub fn collection(role: impl Into<String>, owner_key: Value) -> Self {
        Self::build(CacheKeyKind::Collection, role.into(), owner_key)
    }

    /// Entity or collection.
    pub fn kind(&self) -> CacheKeyKind {
        self.kind
    }

    /// Root entity name or collection role.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier or owner key.
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.kind == other.kind
            && self.name == other.name
            && self.id.same_identifier(&other.id)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Disassembled state stored in a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Concrete entity name, or collection role.
    pub subclass: String,
    /// Disassembled property values or collection elements.
    pub state: Vec<Value>,
    /// Entity version at the time of caching (null for collections).
    pub version: Value,
}

impl CacheEntry {
    /// Serialized form kept by out-of-process regions.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a serialized entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Token proving ownership of a locked cache item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftLock {
    pub lock_id: u64,
    pub timeout: u64,
}

// ============================================================================
// Region access
// ============================================================================

/// Access to one cache region under a concurrency strategy.
pub trait RegionAccessStrategy: Send + Sync {
    /// Region name.
    fn region_name(&self) -> &str;

    /// Read an item, unless it is locked or newer than `tx_timestamp`.
    fn get(&self, key: &CacheKey, tx_timestamp: u64) -> Result<Option<CacheEntry>>;

    /// Cache state just read from the database. Returns whether it was stored.
    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        tx_timestamp: u64,
        version: &Value,
        minimal_put: bool,
    ) -> Result<bool>;

    /// Lock an item ahead of a database write.
    fn lock_item(&self, key: &CacheKey, version: &Value) -> Result<Option<SoftLock>>;

    /// Release a lock taken by `lock_item`.
    fn unlock_item(&self, key: &CacheKey, lock: Option<&SoftLock>) -> Result<()>;

    /// Called after a transaction that inserted the item has committed.
    fn after_insert(&self, key: &CacheKey, entry: &CacheEntry, version: &Value) -> Result<bool>;

    /// Called after a transaction that updated the item has committed; releases `lock`.
    fn after_update(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        current_version: &Value,
        previous_version: &Value,
        lock: Option<&SoftLock>,
    ) -> Result<bool>;

    /// Remove an item as part of a delete.
    fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Forget an item without any transactional semantics.
    fn evict(&self, key: &CacheKey) -> Result<()>;

    /// Forget every item in the region.
    fn evict_all(&self) -> Result<()>;
}

/// Holds a soft lock and releases it when dropped.
///
/// Call [`SoftLockGuard::release`] on the success path to observe unlock
/// failures; on early return the drop still unlocks and logs any failure.
pub struct SoftLockGuard {
    access: Arc<dyn RegionAccessStrategy>,
    key: CacheKey,
    lock: Option<SoftLock>,
    released: bool,
}

impl SoftLockGuard {
    /// Lock `key` in `access`.
    pub fn acquire(
        access: Arc<dyn RegionAccessStrategy>,
        key: CacheKey,
        version: &Value,
    ) -> Result<Self> {
        let lock = access.lock_item(&key, version)?;
        tracing::trace!(
            region = access.region_name(),
            key = %key,
            locked = lock.is_some(),
            "Acquired cache soft lock"
        );
        Ok(Self {
            access,
            key,
            lock,
            released: false,
        })
    }

    /// The key this guard protects.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The lock token, if the strategy issued one.
    pub fn lock(&self) -> Option<&SoftLock> {
        self.lock.as_ref()
    }

    /// Keep the item locked past this guard. The caller must unlock it,
    /// typically once the transaction completes.
    pub fn hand_off(mut self) -> Option<SoftLock> {
        self.released = true;
        self.lock.take()
    }

    /// Unlock now and report failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.access.unlock_item(&self.key, self.lock.as_ref())
    }
}

impl Drop for SoftLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.access.unlock_item(&self.key, self.lock.as_ref()) {
            tracing::warn!(
                region = self.access.region_name(),
                key = %self.key,
                error = %e,
                "Failed to release cache soft lock"
            );
        }
    }
}

impl fmt::Debug for SoftLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftLockGuard")
            .field("region", &self.access.region_name())
            .field("key", &self.key)
            .field("lock", &self.lock)
            .finish()
    }
}

// ============================================================================
// Cache mode
// ============================================================================

/// How a session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Read and write.
    #[default]
    Normal,
    /// Read, but only write items that were updated.
    Get,
    /// Write, never read.
    Put,
    /// Neither read nor write (except invalidation).
    Ignore,
    /// Write, never read, and overwrite existing items.
    Refresh,
}

impl CacheMode {
    /// May the session read from the cache?
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    /// May the session populate the cache from loads?
    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// Build a cache error for `region`.
pub fn cache_error(region: &str, message: impl Into<String>) -> Error {
    Error::Cache(crate::error::CacheError {
        region: region.to_string(),
        message: message.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRegion {
        calls: Mutex<Vec<String>>,
        fail_unlock: bool,
    }

    impl RecordingRegion {
        fn record(&self, call: &str) {
            self.calls.lock().expect("lock poisoned").push(call.to_string());
        }
    }

    impl RegionAccessStrategy for RecordingRegion {
        fn region_name(&self) -> &str {
            "test"
        }
        fn get(&self, _key: &CacheKey, _ts: u64) -> Result<Option<CacheEntry>> {
            Ok(None)
        }
        fn put_from_load(
            &self,
            _key: &CacheKey,
            _entry: &CacheEntry,
            _ts: u64,
            _version: &Value,
            _minimal_put: bool,
        ) -> Result<bool> {
            Ok(false)
        }
        fn lock_item(&self, _key: &CacheKey, _version: &Value) -> Result<Option<SoftLock>> {
            self.record("lock");
            Ok(Some(SoftLock {
                lock_id: 1,
                timeout: 0,
            }))
        }
        fn unlock_item(&self, _key: &CacheKey, lock: Option<&SoftLock>) -> Result<()> {
            self.record(&format!("unlock:{}", lock.map_or(0, |l| l.lock_id)));
            if self.fail_unlock {
                return Err(cache_error("test", "unlock failed"));
            }
            Ok(())
        }
        fn after_insert(&self, _key: &CacheKey, _entry: &CacheEntry, _version: &Value) -> Result<bool> {
            Ok(false)
        }
        fn after_update(
            &self,
            _key: &CacheKey,
            _entry: &CacheEntry,
            _current: &Value,
            _previous: &Value,
            _lock: Option<&SoftLock>,
        ) -> Result<bool> {
            Ok(false)
        }
        fn remove(&self, _key: &CacheKey) -> Result<()> {
            Ok(())
        }
        fn evict(&self, _key: &CacheKey) -> Result<()> {
            Ok(())
        }
        fn evict_all(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let a = Timestamper::next();
        let b = Timestamper::next();
        assert!(b > a);
    }

    #[test]
    fn test_cache_key_equality_across_int_widths() {
        let a = CacheKey::entity("Person", Value::Int(1));
        let b = CacheKey::entity("Person", Value::BigInt(1));
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::collection("Person", Value::BigInt(1)));
        assert_ne!(a, CacheKey::entity("Team", Value::BigInt(1)));
    }

    #[test]
    fn test_cache_entry_bytes() {
        let entry = CacheEntry {
            subclass: "Person".to_string(),
            state: vec![Value::from("Ada"), Value::Null],
            version: Value::BigInt(3),
        };
        let parsed = CacheEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let region = Arc::new(RecordingRegion::default());
        {
            let _guard = SoftLockGuard::acquire(
                Arc::clone(&region) as Arc<dyn RegionAccessStrategy>,
                CacheKey::entity("Person", Value::BigInt(1)),
                &Value::Null,
            )
            .unwrap();
        }
        let calls = region.calls.lock().expect("lock poisoned").clone();
        assert_eq!(calls, vec!["lock".to_string(), "unlock:1".to_string()]);
    }

    #[test]
    fn test_guard_hand_off_keeps_item_locked() {
        let region = Arc::new(RecordingRegion::default());
        let guard = SoftLockGuard::acquire(
            Arc::clone(&region) as Arc<dyn RegionAccessStrategy>,
            CacheKey::entity("Person", Value::BigInt(1)),
            &Value::Null,
        )
        .unwrap();
        let lock = guard.hand_off();
        assert_eq!(lock.map(|l| l.lock_id), Some(1));
        let calls = region.calls.lock().expect("lock poisoned").clone();
        assert_eq!(calls, vec!["lock".to_string()]);
    }

    #[test]
    fn test_guard_release_reports_errors_once() {
        let region = Arc::new(RecordingRegion {
            fail_unlock: true,
            ..RecordingRegion::default()
        });
        let guard = SoftLockGuard::acquire(
            Arc::clone(&region) as Arc<dyn RegionAccessStrategy>,
            CacheKey::entity("Person", Value::BigInt(1)),
            &Value::Null,
        )
        .unwrap();
        assert!(guard.release().is_err());
        // Released explicitly: drop must not unlock a second time.
        assert_eq!(region.calls.lock().expect("lock poisoned").len(), 2);
    }

    #[test]
    fn test_cache_mode_flags() {
        assert!(CacheMode::Normal.is_get_enabled());
        assert!(CacheMode::Normal.is_put_enabled());
        assert!(!CacheMode::Put.is_get_enabled());
        assert!(!CacheMode::Ignore.is_put_enabled());
        assert!(CacheMode::Get.is_get_enabled());
        assert!(!CacheMode::Get.is_put_enabled());
    }
}
