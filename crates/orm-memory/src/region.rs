//! Read-write cache region with soft locks.

use orm_core::{
    CacheEntry, CacheKey, RegionAccessStrategy, Result, SOFT_LOCK_TIMEOUT, SoftLock, Timestamper,
    Value,
};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
enum Slot {
    Item {
        bytes: Vec<u8>,
        version: Value,
        timestamp: u64,
    },
    Locked {
        lock_id: u64,
        version: Value,
        timeout: u64,
        unlock_timestamp: u64,
        multiplicity: u32,
        concurrent: bool,
    },
}

/// Call counters, for asserting on the soft-lock protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounters {
    pub gets: u64,
    pub puts: u64,
    pub locks: u64,
    pub unlocks: u64,
}

/// A cache region holding serialized entries under a read-write strategy.
///
/// Locked items are invisible to readers and reject loads until every lock
/// holder has released them or the lock times out.
#[derive(Debug)]
pub struct MemoryRegion {
    name: String,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    next_lock_id: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    locks: AtomicU64,
    unlocks: AtomicU64,
}

fn is_newer(new_version: &Value, old_version: &Value) -> bool {
    match new_version.compare_numeric(old_version) {
        Some(order) => order == CmpOrdering::Greater,
        None => false,
    }
}

impl MemoryRegion {
    /// Create an empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(HashMap::new()),
            next_lock_id: AtomicU64::new(1),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            locks: AtomicU64::new(0),
            unlocks: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of readable items.
    pub fn item_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Item { .. }))
            .count()
    }

    /// Is `key` currently soft-locked?
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        matches!(self.slots().get(key), Some(Slot::Locked { multiplicity, .. }) if *multiplicity > 0)
    }

    /// Read an item regardless of timestamps.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.slots().get(key) {
            Some(Slot::Item { bytes, .. }) => CacheEntry::from_bytes(bytes).ok(),
            _ => None,
        }
    }

    /// Call counters so far.
    pub fn counters(&self) -> RegionCounters {
        RegionCounters {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            locks: self.locks.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
        }
    }

    fn store_item(
        &self,
        slots: &mut HashMap<CacheKey, Slot>,
        key: &CacheKey,
        entry: &CacheEntry,
        version: &Value,
    ) -> Result<()> {
        slots.insert(
            key.clone(),
            Slot::Item {
                bytes: entry.to_bytes()?,
                version: version.clone(),
                timestamp: Timestamper::next(),
            },
        );
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn handle_lock_expiry(&self, slots: &mut HashMap<CacheKey, Slot>, key: &CacheKey) {
        tracing::warn!(
            region = %self.name,
            key = %key,
            "Cache soft lock expired or was replaced; item stays invalid until reloaded"
        );
        let now = Timestamper::next();
        slots.insert(
            key.clone(),
            Slot::Locked {
                lock_id: 0,
                version: Value::Null,
                timeout: now,
                unlock_timestamp: now,
                multiplicity: 0,
                concurrent: true,
            },
        );
    }

    fn decrement_lock(slot: &mut Slot) {
        if let Slot::Locked {
            multiplicity,
            unlock_timestamp,
            ..
        } = slot
        {
            *multiplicity = multiplicity.saturating_sub(1);
            if *multiplicity == 0 {
                *unlock_timestamp = Timestamper::next();
            }
        }
    }
}

impl RegionAccessStrategy for MemoryRegion {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey, tx_timestamp: u64) -> Result<Option<CacheEntry>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let slots = self.slots();
        match slots.get(key) {
            Some(Slot::Item {
                bytes, timestamp, ..
            }) if *timestamp <= tx_timestamp => Ok(Some(CacheEntry::from_bytes(bytes)?)),
            _ => Ok(None),
        }
    }

    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        tx_timestamp: u64,
        version: &Value,
        minimal_put: bool,
    ) -> Result<bool> {
        let mut slots = self.slots();
        let writeable = match slots.get(key) {
            None => true,
            Some(Slot::Item {
                version: cached, ..
            }) => !minimal_put && is_newer(version, cached),
            Some(Slot::Locked {
                version: locked,
                timeout,
                unlock_timestamp,
                multiplicity,
                ..
            }) => {
                if tx_timestamp > *timeout {
                    true
                } else if *multiplicity > 0 {
                    false
                } else if locked.is_null() {
                    tx_timestamp > *unlock_timestamp
                } else {
                    is_newer(version, locked)
                }
            }
        };
        if !writeable {
            tracing::trace!(region = %self.name, key = %key, "Cached item not writeable");
            return Ok(false);
        }
        self.store_item(&mut slots, key, entry, version)?;
        Ok(true)
    }

    fn lock_item(&self, key: &CacheKey, version: &Value) -> Result<Option<SoftLock>> {
        self.locks.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots();
        let timeout = Timestamper::next() + SOFT_LOCK_TIMEOUT;
        if let Some(Slot::Locked {
            lock_id,
            timeout: lock_timeout,
            multiplicity,
            concurrent,
            ..
        }) = slots.get_mut(key)
        {
            if *multiplicity > 0 {
                *multiplicity += 1;
                *concurrent = true;
                *lock_timeout = timeout;
                return Ok(Some(SoftLock {
                    lock_id: *lock_id,
                    timeout,
                }));
            }
        }
        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            key.clone(),
            Slot::Locked {
                lock_id,
                version: version.clone(),
                timeout,
                unlock_timestamp: 0,
                multiplicity: 1,
                concurrent: false,
            },
        );
        Ok(Some(SoftLock { lock_id, timeout }))
    }

    fn unlock_item(&self, key: &CacheKey, lock: Option<&SoftLock>) -> Result<()> {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots();
        let unlockable = matches!(
            (slots.get(key), lock),
            (Some(Slot::Locked { lock_id, .. }), Some(held)) if *lock_id == held.lock_id
        );
        if unlockable {
            if let Some(slot) = slots.get_mut(key) {
                Self::decrement_lock(slot);
            }
        } else {
            self.handle_lock_expiry(&mut slots, key);
        }
        Ok(())
    }

    fn after_insert(&self, key: &CacheKey, entry: &CacheEntry, version: &Value) -> Result<bool> {
        let mut slots = self.slots();
        if slots.contains_key(key) {
            return Ok(false);
        }
        self.store_item(&mut slots, key, entry, version)?;
        Ok(true)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        current_version: &Value,
        _previous_version: &Value,
        lock: Option<&SoftLock>,
    ) -> Result<bool> {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots();
        let state = match (slots.get(key), lock) {
            (Some(Slot::Locked { lock_id, concurrent, .. }), Some(held)) if *lock_id == held.lock_id => {
                Some(*concurrent)
            }
            _ => None,
        };
        match state {
            Some(true) => {
                if let Some(slot) = slots.get_mut(key) {
                    Self::decrement_lock(slot);
                }
                Ok(false)
            }
            Some(false) => {
                self.store_item(&mut slots, key, entry, current_version)?;
                Ok(true)
            }
            None => {
                self.handle_lock_expiry(&mut slots, key);
                Ok(false)
            }
        }
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut slots = self.slots();
        if matches!(slots.get(key), Some(Slot::Item { .. })) {
            slots.remove(key);
        }
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<()> {
        self.slots().remove(key);
        Ok(())
    }

    fn evict_all(&self) -> Result<()> {
        self.slots().clear();
        Ok(())
    }
}
