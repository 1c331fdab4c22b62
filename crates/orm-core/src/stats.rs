//! Runtime statistics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Second-level cache counters of one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub flushes: u64,
    pub entity_loads: u64,
    pub entity_fetches: u64,
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    pub collection_loads: u64,
    pub collection_fetches: u64,
    pub collection_recreates: u64,
    pub collection_updates: u64,
    pub collection_removes: u64,
    pub optimistic_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
    pub regions: BTreeMap<String, RegionStatistics>,
}

/// Counter sink shared by every session of a factory.
///
/// Recording is a no-op while disabled.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    flushes: AtomicU64,
    entity_loads: AtomicU64,
    entity_fetches: AtomicU64,
    entity_inserts: AtomicU64,
    entity_updates: AtomicU64,
    entity_deletes: AtomicU64,
    collection_loads: AtomicU64,
    collection_fetches: AtomicU64,
    collection_recreates: AtomicU64,
    collection_updates: AtomicU64,
    collection_removes: AtomicU64,
    optimistic_failures: AtomicU64,
    regions: Mutex<BTreeMap<String, RegionStatistics>>,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $method:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $method(&self) {
                if self.is_enabled() {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            }
        )*
    };
}

impl Statistics {
    /// Create a sink, enabled or not.
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.enabled.store(enabled, Ordering::Relaxed);
        stats
    }

    /// Are counters being recorded?
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn recording on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    counter! {
        /// A session was opened.
        session_opened => sessions_opened;
        /// A session was closed.
        session_closed => sessions_closed;
        /// A flush ran.
        flush => flushes;
        /// An entity was assembled from a row or a cache entry.
        entity_loaded => entity_loads;
        /// An entity row was read from the database.
        entity_fetched => entity_fetches;
        /// An entity was inserted.
        entity_inserted => entity_inserts;
        /// An entity was updated.
        entity_updated => entity_updates;
        /// An entity was deleted.
        entity_deleted => entity_deletes;
        /// A collection was initialized.
        collection_loaded => collection_loads;
        /// A collection was read from the database.
        collection_fetched => collection_fetches;
        /// A collection was written from scratch.
        collection_recreated => collection_recreates;
        /// A collection's rows were updated.
        collection_updated => collection_updates;
        /// A collection's rows were removed.
        collection_removed => collection_removes;
        /// An optimistic version check failed.
        optimistic_failure => optimistic_failures;
    }

    fn region(&self, region: &str, record: impl FnOnce(&mut RegionStatistics)) {
        if !self.is_enabled() {
            return;
        }
        let mut regions = match self.regions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        record(regions.entry(region.to_string()).or_default());
    }

    /// A second-level cache read found an item.
    pub fn cache_hit(&self, region: &str) {
        self.region(region, |r| r.hits += 1);
    }

    /// A second-level cache read found nothing.
    pub fn cache_miss(&self, region: &str) {
        self.region(region, |r| r.misses += 1);
    }

    /// An item was stored in the second-level cache.
    pub fn cache_put(&self, region: &str) {
        self.region(region, |r| r.puts += 1);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let regions = match self.regions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        StatisticsSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
            flushes: load(&self.flushes),
            entity_loads: load(&self.entity_loads),
            entity_fetches: load(&self.entity_fetches),
            entity_inserts: load(&self.entity_inserts),
            entity_updates: load(&self.entity_updates),
            entity_deletes: load(&self.entity_deletes),
            collection_loads: load(&self.collection_loads),
            collection_fetches: load(&self.collection_fetches),
            collection_recreates: load(&self.collection_recreates),
            collection_updates: load(&self.collection_updates),
            collection_removes: load(&self.collection_removes),
            optimistic_failures: load(&self.optimistic_failures),
            cache_hits: regions.values().map(|r| r.hits).sum(),
            cache_misses: regions.values().map(|r| r.misses).sum(),
            cache_puts: regions.values().map(|r| r.puts).sum(),
            regions,
        }
    }

    /// Reset every counter to zero.
    pub fn clear(&self) {
        for counter in [
            &self.sessions_opened,
            &self.sessions_closed,
            &self.flushes,
            &self.entity_loads,
            &self.entity_fetches,
            &self.entity_inserts,
            &self.entity_updates,
            &self.entity_deletes,
            &self.collection_loads,
            &self.collection_fetches,
            &self.collection_recreates,
            &self.collection_updates,
            &self.collection_removes,
            &self.optimistic_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        match self.regions.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}
