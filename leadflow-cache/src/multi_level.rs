//! Two-tier cache: local [`ExpiringLruCache`] in front of an optional
//! shared [`L2Store`].
//!
//! Reads check L1, then L2; an L2 hit is promoted into L1 with its remaining
//! TTL. Writes go to L1 synchronously and to L2 best-effort. L2 errors never
//! reach the caller.
//!
//! L2 reachability is decided once, at construction. If the ping fails the
//! instance runs L1-only for the rest of its life and the failure is logged
//! a single time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leadflow_core::{
    add_duration, elapsed_between, CacheConfig, CacheError, HealthCheck, LeadflowResult,
    SharedClock, Timestamp,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::lmdb_store::LmdbStore;
use crate::local::{ExpiringLruCache, LocalCacheStats};
use crate::traits::L2Store;

/// Payload stored in L2.
#[derive(Debug, Serialize, Deserialize)]
struct L2Envelope<T> {
    value: T,
    expires_at: Timestamp,
}

/// Counters of a [`MultiLevelCache`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MultiLevelStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub l2_errors: u64,
    pub l1: LocalCacheStats,
    pub l2_enabled: bool,
}

impl MultiLevelStats {
    /// Fraction of reads served by either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    l2_errors: AtomicU64,
}

/// Multi-level cache of serializable values keyed by string.
#[derive(Debug)]
pub struct MultiLevelCache<V = serde_json::Value> {
    l1: ExpiringLruCache<String, V>,
    l2: Option<Arc<dyn L2Store>>,
    /// An L2 store was supplied but failed its startup check.
    l2_degraded: bool,
    default_ttl: Duration,
    clock: SharedClock,
    counters: Counters,
}

impl<V> MultiLevelCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create an L1-only cache.
    pub fn local_only(config: &CacheConfig, clock: SharedClock) -> LeadflowResult<Self> {
        config.validate()?;
        Ok(Self {
            l1: ExpiringLruCache::from_config(config, clock.clone())?,
            l2: None,
            l2_degraded: false,
            default_ttl: config.default_ttl,
            clock,
            counters: Counters::default(),
        })
    }

    /// Create a cache backed by `l2`, pinging it once.
    ///
    /// An unreachable store is not an error: the cache degrades to L1-only.
    pub async fn connect(
        config: &CacheConfig,
        l2: Option<Arc<dyn L2Store>>,
        clock: SharedClock,
    ) -> LeadflowResult<Self> {
        let mut cache = Self::local_only(config, clock)?;
        if let Some(store) = l2 {
            match store.ping().await {
                Ok(()) => {
                    tracing::info!(backend = store.name(), "L2 cache connected");
                    cache.l2 = Some(store);
                }
                Err(e) => {
                    tracing::warn!(
                        backend = store.name(),
                        error = %e,
                        "L2 cache unavailable, continuing with local cache only"
                    );
                    cache.l2_degraded = true;
                }
            }
        }
        Ok(cache)
    }

    /// Create a cache from configuration, opening an LMDB store when
    /// `l2_path` is set.
    pub async fn from_config(config: &CacheConfig, clock: SharedClock) -> LeadflowResult<Self> {
        let Some(path) = &config.l2_path else {
            return Self::local_only(config, clock);
        };

        match LmdbStore::open_with_clock(path, config.l2_max_size_mb, clock.clone()) {
            Ok(store) => {
                let store: Arc<dyn L2Store> = Arc::new(store);
                Self::connect(config, Some(store), clock).await
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "L2 cache unavailable, continuing with local cache only"
                );
                let mut cache = Self::local_only(config, clock)?;
                cache.l2_degraded = true;
                Ok(cache)
            }
        }
    }

    fn record_l2_error(&self, operation: &str, key: &str, error: &CacheError) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(operation, key, error = %error, "L2 cache operation failed");
    }

    /// Look up `key` in L1, then L2.
    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.l1.get(&key.to_string()) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(l2) = &self.l2 {
            if let Some(value) = self.get_from_l2(l2.as_ref(), key).await {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn get_from_l2(&self, l2: &dyn L2Store, key: &str) -> Option<V> {
        let bytes = match l2.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.record_l2_error("get", key, &e);
                return None;
            }
        };

        let envelope: L2Envelope<V> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = CacheError::Serialization {
                    reason: e.to_string(),
                };
                self.record_l2_error("decode", key, &error);
                return None;
            }
        };

        let remaining = elapsed_between(self.clock.now(), envelope.expires_at);
        if remaining.is_zero() {
            return None;
        }

        self.l1
            .set(key.to_string(), envelope.value.clone(), Some(remaining));
        Some(envelope.value)
    }

    /// Store `value` in both tiers. `ttl` of `None` uses the default TTL.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        let Some(l2) = &self.l2 else {
            self.l1.set(key.to_string(), value, Some(ttl));
            return;
        };

        let envelope = L2Envelope {
            value: &value,
            expires_at: add_duration(self.clock.now(), ttl),
        };
        let payload = serde_json::to_vec(&envelope);
        self.l1.set(key.to_string(), value, Some(ttl));

        match payload {
            Ok(bytes) => {
                if let Err(e) = l2.set_ex(key, bytes, ttl).await {
                    self.record_l2_error("set", key, &e);
                }
            }
            Err(e) => {
                let error = CacheError::Serialization {
                    reason: e.to_string(),
                };
                self.record_l2_error("encode", key, &error);
            }
        }
    }

    /// Remove `key` from L1 and, best-effort, from L2.
    ///
    /// Returns whether either tier held the key.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.l1.delete(&key.to_string());
        if let Some(l2) = &self.l2 {
            match l2.delete(key).await {
                Ok(deleted) => removed |= deleted,
                Err(e) => self.record_l2_error("delete", key, &e),
            }
        }
        removed
    }

    /// Drop every local entry. L2 is left untouched.
    pub fn clear_local(&self) {
        self.l1.clear();
    }

    pub fn is_l2_enabled(&self) -> bool {
        self.l2.is_some()
    }

    pub fn stats(&self) -> MultiLevelStats {
        MultiLevelStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            l1: self.l1.stats(),
            l2_enabled: self.is_l2_enabled(),
        }
    }

    pub fn health(&self) -> HealthCheck {
        let check = if self.l2_degraded {
            HealthCheck::degraded("cache", "L2 unavailable at startup, serving from local cache")
        } else {
            HealthCheck::healthy("cache")
        };
        check
            .with_metadata("l2_enabled", serde_json::json!(self.is_l2_enabled()))
            .with_metadata("l1_size", serde_json::json!(self.l1.size()))
    }
}
