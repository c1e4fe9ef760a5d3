//! Fixed-capacity local cache with per-entry TTL.
//!
//! Recency order is kept by [`lru::LruCache`]. Every operation takes the
//! single store lock for its whole duration and never awaits while holding
//! it, so the cache is safe to share between tasks behind an `Arc`.
//!
//! Expired entries are removed lazily: a `get` that finds an expired entry
//! drops it and reports a miss, regardless of its position in recency
//! order. [`ExpiringLruCache::purge_expired`] sweeps them eagerly.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use leadflow_core::{
    add_duration, system_clock, CacheConfig, ConfigError, EvictionPolicy, SharedClock, Timestamp,
};
use lru::LruCache;
use serde::Serialize;

/// A cached value with its timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Timestamp,
    /// `None` means the entry never expires.
    pub expires_at: Option<Timestamp>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Timestamp, ttl: Option<Duration>) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| add_duration(now, ttl)),
        }
    }

    /// True once `now` has reached the expiry time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Point-in-time counters of an [`ExpiringLruCache`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalCacheStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl LocalCacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug)]
struct Store<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    counters: Counters,
}

/// Fixed-capacity key/value cache with TTL and recency-based eviction.
///
/// Under [`EvictionPolicy::Lru`] both a successful `get` and a `set` on an
/// existing key count as a touch. Under [`EvictionPolicy::Fifo`] nothing
/// reorders entries after insertion, so the oldest insert is evicted first.
#[derive(Debug)]
pub struct ExpiringLruCache<K: Hash + Eq, V> {
    store: Mutex<Store<K, V>>,
    capacity: NonZeroUsize,
    policy: EvictionPolicy,
    clock: SharedClock,
}

impl<K, V> ExpiringLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create an LRU cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Self::with_policy(capacity, EvictionPolicy::Lru, system_clock())
    }

    /// Create a cache with an explicit eviction policy and clock.
    pub fn with_policy(
        capacity: usize,
        policy: EvictionPolicy,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| ConfigError::InvalidValue {
            field: "capacity".to_string(),
            value: capacity.to_string(),
            reason: "must be greater than 0".to_string(),
        })?;
        Ok(Self {
            store: Mutex::new(Store {
                entries: LruCache::new(capacity),
                counters: Counters::default(),
            }),
            capacity,
            policy,
            clock,
        })
    }

    /// Create the local tier described by a cache configuration.
    pub fn from_config(config: &CacheConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::with_policy(config.local_cache_size, config.eviction_policy, clock)
    }

    fn lock(&self) -> MutexGuard<'_, Store<K, V>> {
        // Every mutation leaves the store consistent, so a poisoned lock is
        // still safe to use.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let store = &mut *guard;

        let expired = match store.entries.peek(key) {
            None => {
                store.counters.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            store.entries.pop(key);
            store.counters.expirations += 1;
            store.counters.misses += 1;
            return None;
        }

        let entry = match self.policy {
            EvictionPolicy::Lru => store.entries.get(key),
            EvictionPolicy::Fifo => store.entries.peek(key),
        };
        let value = entry.map(|e| e.value.clone());
        if value.is_some() {
            store.counters.hits += 1;
        }
        value
    }

    /// Insert or replace `key`. A `ttl` of `None` never expires.
    ///
    /// When the cache is full and `key` is new, the entry at the cold end of
    /// the recency order is evicted first.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry::new(value, self.clock.now(), ttl);
        let mut guard = self.lock();
        let store = &mut *guard;

        if store.entries.contains(&key) {
            match self.policy {
                EvictionPolicy::Lru => {
                    store.entries.put(key, entry);
                }
                EvictionPolicy::Fifo => {
                    if let Some(slot) = store.entries.peek_mut(&key) {
                        *slot = entry;
                    }
                }
            }
            return;
        }

        if store.entries.len() >= self.capacity.get() && store.entries.pop_lru().is_some() {
            store.counters.evictions += 1;
        }
        store.entries.put(key, entry);
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &K) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Number of stored entries, including expired ones not yet removed.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// True if `key` is present and unexpired. Does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Read `key` without touching recency or counters.
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.lock();
        let store = &mut *guard;

        let expired: Vec<K> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.entries.pop(key);
        }
        store.counters.expirations += expired.len() as u64;
        expired.len()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        self.lock().entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn stats(&self) -> LocalCacheStats {
        let store = self.lock();
        let size = store.entries.len();
        LocalCacheStats {
            size,
            capacity: self.capacity.get(),
            utilization: size as f64 / self.capacity.get() as f64,
            hits: store.counters.hits,
            misses: store.counters.misses,
            evictions: store.counters.evictions,
            expirations: store.counters.expirations,
        }
    }
}
