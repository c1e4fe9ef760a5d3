//! Batching loader.
//!
//! Coalesces single-key loads issued close together into one call to a
//! [`BatchFn`]. Each pending key holds a oneshot sender per waiter; a key
//! requested twice in one batch is fetched once and both waiters get the
//! same outcome.
//!
//! # Flush policy
//!
//! A collecting batch is dispatched when the first of these happens:
//!
//! 1. the number of distinct pending keys reaches `batch_size`;
//! 2. the flush task spawned by the batch's first key runs. It yields once
//!    to the scheduler (letting every already-runnable task enqueue its
//!    keys), then sleeps for `flush_delay` if that is non-zero;
//! 3. [`BatchLoader::flush`] is called.
//!
//! Batches always execute on their own spawned task, so dropping a waiting
//! `load` future never cancels the batch. The results are still cached and
//! delivered to the remaining waiters.
//!
//! Loads must run inside a Tokio runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use leadflow_cache::ExpiringLruCache;
use leadflow_core::{
    system_clock, EvictionPolicy, LeadflowResult, LoaderConfig, LoaderError, SharedClock,
};
use leadflow_guard::{CallError, CircuitBreaker};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::batch_fn::{BatchFn, LoaderKey, LoaderValue};

type Waiter<V> = oneshot::Sender<Result<V, LoaderError>>;

/// Counters of one loader.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoaderStats {
    pub name: String,
    /// `{cache_key_prefix}:{name}`
    pub namespace: String,
    pub batches_executed: u64,
    pub failed_batches: u64,
    pub keys_loaded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub persistent_cache_size: usize,
    pub request_cache_size: usize,
    pub max_batch_size: usize,
}

impl LoaderStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches_executed: AtomicU64,
    failed_batches: AtomicU64,
    keys_loaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Keys collected for the next dispatch.
struct PendingBatch<K, V> {
    /// Distinct keys in first-request order.
    keys: Vec<K>,
    waiters: HashMap<K, Vec<Waiter<V>>>,
    /// Bumped on every dispatch so a stale flush task does nothing.
    generation: u64,
}

impl<K: LoaderKey, V> PendingBatch<K, V> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            waiters: HashMap::new(),
            generation: 0,
        }
    }

    fn take(&mut self) -> (Vec<K>, HashMap<K, Vec<Waiter<V>>>) {
        self.generation = self.generation.wrapping_add(1);
        (
            std::mem::take(&mut self.keys),
            std::mem::take(&mut self.waiters),
        )
    }
}

struct LoaderInner<K: LoaderKey, V> {
    name: String,
    namespace: String,
    config: LoaderConfig,
    batch_fn: Arc<dyn BatchFn<K, V>>,
    breaker: Option<Arc<CircuitBreaker>>,
    persistent: Option<ExpiringLruCache<K, V>>,
    request_cache: Mutex<HashMap<K, V>>,
    pending: Mutex<PendingBatch<K, V>>,
    counters: Counters,
}

/// Batching, caching loader for one kind of entity.
///
/// Cheap to clone; clones share batches and caches.
pub struct BatchLoader<K: LoaderKey, V: LoaderValue> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K: LoaderKey, V: LoaderValue> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: LoaderKey, V: LoaderValue> fmt::Debug for BatchLoader<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoader")
            .field("name", &self.inner.name)
            .field("batch_size", &self.inner.config.batch_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`BatchLoader`].
pub struct BatchLoaderBuilder<K: LoaderKey, V: LoaderValue> {
    name: String,
    batch_fn: Arc<dyn BatchFn<K, V>>,
    config: LoaderConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    clock: SharedClock,
}

impl<K: LoaderKey, V: LoaderValue> BatchLoaderBuilder<K, V> {
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Protect the batch function with a circuit breaker.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Clock used for persistent cache expiry.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> LeadflowResult<BatchLoader<K, V>> {
        self.config.validate()?;
        let persistent = if self.config.enable_persistent_cache {
            Some(ExpiringLruCache::with_policy(
                self.config.cache_size,
                EvictionPolicy::Lru,
                self.clock,
            )?)
        } else {
            None
        };
        let namespace = format!("{}:{}", self.config.cache_key_prefix, self.name);

        Ok(BatchLoader {
            inner: Arc::new(LoaderInner {
                name: self.name,
                namespace,
                config: self.config,
                batch_fn: self.batch_fn,
                breaker: self.breaker,
                persistent,
                request_cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingBatch::new()),
                counters: Counters::default(),
            }),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K: LoaderKey, V: LoaderValue> BatchLoader<K, V> {
    pub fn builder(
        name: impl Into<String>,
        batch_fn: impl BatchFn<K, V> + 'static,
    ) -> BatchLoaderBuilder<K, V> {
        BatchLoaderBuilder {
            name: name.into(),
            batch_fn: Arc::new(batch_fn),
            config: LoaderConfig::default(),
            breaker: None,
            clock: system_clock(),
        }
    }

    /// Create a loader with the given configuration and no breaker.
    pub fn new(
        name: impl Into<String>,
        batch_fn: impl BatchFn<K, V> + 'static,
        config: LoaderConfig,
    ) -> LeadflowResult<Self> {
        Self::builder(name, batch_fn).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn cached(&self, key: &K) -> Option<V> {
        let inner = &self.inner;
        if inner.config.enable_request_cache {
            if let Some(value) = lock(&inner.request_cache).get(key) {
                return Some(value.clone());
            }
        }
        let value = inner.persistent.as_ref()?.get(key)?;
        if inner.config.enable_request_cache {
            lock(&inner.request_cache).insert(key.clone(), value.clone());
        }
        Some(value)
    }

    /// Load one key, joining the currently collecting batch on a cache miss.
    pub async fn load(&self, key: K) -> Result<V, LoaderError> {
        if let Some(value) = self.cached(&key) {
            self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.inner
            .counters
            .cache_misses
            .fetch_add(1, Ordering::Relaxed);

        let rx = self.enqueue(key);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LoaderError::Dropped {
                loader: self.inner.name.clone(),
            }),
        }
    }

    fn enqueue(&self, key: K) -> oneshot::Receiver<Result<V, LoaderError>> {
        let (tx, rx) = oneshot::channel();
        let threshold = self
            .inner
            .config
            .batch_size
            .min(self.inner.config.max_batch_size);

        let mut pending = lock(&self.inner.pending);
        let opened = pending.keys.is_empty();
        let waiters = pending.waiters.entry(key.clone()).or_default();
        let first_waiter = waiters.is_empty();
        waiters.push(tx);
        if first_waiter {
            pending.keys.push(key);
        }

        if pending.keys.len() >= threshold {
            let batch = pending.take();
            drop(pending);
            self.spawn_dispatch(batch);
        } else if opened {
            let generation = pending.generation;
            drop(pending);
            self.spawn_flush_timer(generation);
        }
        rx
    }

    fn spawn_flush_timer(&self, generation: u64) {
        let loader = self.clone();
        let delay = self.inner.config.flush_delay;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let batch = {
                let mut pending = lock(&loader.inner.pending);
                if pending.generation != generation || pending.keys.is_empty() {
                    return;
                }
                pending.take()
            };
            loader.dispatch(batch).await;
        });
    }

    fn spawn_dispatch(
        &self,
        batch: (Vec<K>, HashMap<K, Vec<Waiter<V>>>),
    ) -> tokio::task::JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move { loader.dispatch(batch).await })
    }

    /// Dispatch the collecting batch now and wait for it to finish.
    pub async fn flush(&self) {
        let batch = {
            let mut pending = lock(&self.inner.pending);
            if pending.keys.is_empty() {
                return;
            }
            pending.take()
        };
        // A join error means the batch task panicked; waiters see Dropped.
        let _ = self.spawn_dispatch(batch).await;
    }

    async fn dispatch(&self, (keys, mut waiters): (Vec<K>, HashMap<K, Vec<Waiter<V>>>)) {
        let max = self.inner.config.max_batch_size.max(1);
        for chunk in keys.chunks(max) {
            tracing::debug!(
                loader = %self.inner.name,
                keys = chunk.len(),
                "Dispatching batch"
            );
            let outcome = self.execute(chunk).await;
            self.deliver(chunk, outcome, &mut waiters);
        }
    }

    /// Run the batch function under the timeout and optional breaker.
    async fn execute(&self, keys: &[K]) -> Result<Vec<V>, LoaderError> {
        let inner = &self.inner;
        let timeout = inner.config.batch_timeout;
        let attempt = || async {
            match tokio::time::timeout(timeout, inner.batch_fn.load(keys)).await {
                Ok(Ok(values)) => Ok(values),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("batch timed out after {:?}", timeout)),
            }
        };

        let result = match &inner.breaker {
            Some(breaker) => breaker.call(attempt).await,
            None => attempt().await.map_err(CallError::Inner),
        };

        result.map_err(|e| {
            let key_set = keys.iter().map(|k| k.to_string()).collect();
            match e {
                CallError::Open(source) => LoaderError::CircuitOpen {
                    loader: inner.name.clone(),
                    keys: key_set,
                    source,
                },
                CallError::Timeout { timeout, .. } => LoaderError::BatchExecution {
                    loader: inner.name.clone(),
                    keys: key_set,
                    reason: format!("batch timed out after {:?}", timeout),
                },
                CallError::Inner(reason) => LoaderError::BatchExecution {
                    loader: inner.name.clone(),
                    keys: key_set,
                    reason,
                },
            }
        })
    }

    fn deliver(
        &self,
        keys: &[K],
        outcome: Result<Vec<V>, LoaderError>,
        waiters: &mut HashMap<K, Vec<Waiter<V>>>,
    ) {
        let inner = &self.inner;
        let values = match outcome {
            Ok(values) if values.len() == keys.len() => values,
            Ok(values) => {
                let err = LoaderError::BatchShape {
                    loader: inner.name.clone(),
                    keys: keys.iter().map(|k| k.to_string()).collect(),
                    expected: keys.len(),
                    got: values.len(),
                };
                tracing::warn!(loader = %inner.name, error = %err, "Batch function broke its contract");
                self.fail_all(keys, err, waiters);
                return;
            }
            Err(err) => {
                tracing::warn!(loader = %inner.name, error = %err, "Batch failed");
                self.fail_all(keys, err, waiters);
                return;
            }
        };

        inner.counters.batches_executed.fetch_add(1, Ordering::Relaxed);
        inner
            .counters
            .keys_loaded
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        for (key, value) in keys.iter().zip(values) {
            if let Some(persistent) = &inner.persistent {
                persistent.set(key.clone(), value.clone(), Some(inner.config.cache_ttl));
            }
            if inner.config.enable_request_cache {
                lock(&inner.request_cache).insert(key.clone(), value.clone());
            }
            for tx in waiters.remove(key).unwrap_or_default() {
                // The receiver is gone if its caller was cancelled.
                let _ = tx.send(Ok(value.clone()));
            }
        }
    }

    fn fail_all(&self, keys: &[K], err: LoaderError, waiters: &mut HashMap<K, Vec<Waiter<V>>>) {
        self.inner
            .counters
            .failed_batches
            .fetch_add(1, Ordering::Relaxed);
        for key in keys {
            for tx in waiters.remove(key).unwrap_or_default() {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Load several keys concurrently so they share batches.
    ///
    /// Results are returned in key order.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<Result<V, LoaderError>> {
        join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Seed both caches with a known value.
    pub fn prime(&self, key: K, value: V) {
        let inner = &self.inner;
        if let Some(persistent) = &inner.persistent {
            persistent.set(key.clone(), value.clone(), Some(inner.config.cache_ttl));
        }
        if inner.config.enable_request_cache {
            lock(&inner.request_cache).insert(key, value);
        }
    }

    /// Drop `key` from both caches.
    pub fn clear(&self, key: &K) {
        if let Some(persistent) = &self.inner.persistent {
            persistent.delete(key);
        }
        lock(&self.inner.request_cache).remove(key);
    }

    /// Drop the request-scoped cache. Call between units of work.
    pub fn clear_request_cache(&self) {
        lock(&self.inner.request_cache).clear();
    }

    /// Drop both caches.
    pub fn clear_all(&self) {
        if let Some(persistent) = &self.inner.persistent {
            persistent.clear();
        }
        self.clear_request_cache();
    }

    pub fn stats(&self) -> LoaderStats {
        let inner = &self.inner;
        LoaderStats {
            name: inner.name.clone(),
            namespace: inner.namespace.clone(),
            batches_executed: inner.counters.batches_executed.load(Ordering::Relaxed),
            failed_batches: inner.counters.failed_batches.load(Ordering::Relaxed),
            keys_loaded: inner.counters.keys_loaded.load(Ordering::Relaxed),
            cache_hits: inner.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.counters.cache_misses.load(Ordering::Relaxed),
            persistent_cache_size: inner.persistent.as_ref().map_or(0, |c| c.size()),
            request_cache_size: lock(&inner.request_cache).len(),
            max_batch_size: inner.config.max_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_fn::{batch_fn, BatchError};
    use async_trait::async_trait;
    use leadflow_core::{CircuitBreakerConfig, ManualClock};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Doubles every key and records each call's key list.
    #[derive(Default)]
    struct Doubler {
        calls: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchFn<u32, u64> for Arc<Doubler> {
        async fn load(&self, keys: &[u32]) -> Result<Vec<u64>, BatchError> {
            lock(&self.calls).push(keys.to_vec());
            Ok(keys.iter().map(|k| u64::from(*k) * 2).collect())
        }
    }

    fn doubler_loader(config: LoaderConfig) -> (BatchLoader<u32, u64>, Arc<Doubler>) {
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::new("doubler", doubler.clone(), config).expect("valid config");
        (loader, doubler)
    }

    fn calls(doubler: &Doubler) -> Vec<Vec<u32>> {
        lock(&doubler.calls).clone()
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce_into_one_batch() {
        let (loader, doubler) = doubler_loader(LoaderConfig::default());
        let keys = vec![1, 2, 3, 2, 1, 4, 3];

        let results = loader.load_many(keys.clone()).await;
        let values: Vec<u64> = results
            .into_iter()
            .map(|r| r.expect("load should succeed"))
            .collect();
        assert_eq!(values, vec![2, 4, 6, 4, 2, 8, 6]);

        assert_eq!(calls(&doubler), vec![vec![1, 2, 3, 4]]);
        let stats = loader.stats();
        assert_eq!(stats.batches_executed, 1);
        assert_eq!(stats.keys_loaded, 4);
    }

    #[tokio::test]
    async fn test_separate_tasks_share_a_batch() {
        let (loader, doubler) = doubler_loader(LoaderConfig::default());
        let handles: Vec<_> = (0..5u32)
            .map(|k| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.load(k).await })
            })
            .collect();
        for (k, handle) in handles.into_iter().enumerate() {
            let value = handle.await.expect("task completes").expect("load succeeds");
            assert_eq!(value, k as u64 * 2);
        }
        assert_eq!(calls(&doubler).len(), 1);
    }

    #[tokio::test]
    async fn test_size_threshold_dispatches_immediately() {
        let (loader, doubler) = doubler_loader(LoaderConfig::default().with_batch_size(2));
        let results = loader.load_many(vec![1, 2, 3, 4, 5]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(calls(&doubler), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_request_cache_serves_repeat_loads() {
        let (loader, doubler) =
            doubler_loader(LoaderConfig::default().with_persistent_cache(false));
        assert_eq!(loader.load(7).await, Ok(14));
        assert_eq!(loader.load(7).await, Ok(14));
        assert_eq!(calls(&doubler).len(), 1);

        loader.clear_request_cache();
        assert_eq!(loader.load(7).await, Ok(14));
        assert_eq!(calls(&doubler).len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_cache_survives_request_boundary() {
        let clock = ManualClock::starting_now();
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::builder("doubler", doubler.clone())
            .config(LoaderConfig::default().with_cache_ttl(Duration::from_secs(60)))
            .clock(clock.shared())
            .build()
            .expect("valid config");

        assert_eq!(loader.load(3).await, Ok(6));
        loader.clear_request_cache();
        assert_eq!(loader.load(3).await, Ok(6));
        assert_eq!(calls(&doubler).len(), 1);
        assert_eq!(loader.stats().request_cache_size, 1, "backfilled");

        loader.clear_request_cache();
        clock.advance(Duration::from_secs(60));
        assert_eq!(loader.load(3).await, Ok(6));
        assert_eq!(calls(&doubler).len(), 2, "persistent entry expired");
    }

    #[tokio::test]
    async fn test_batch_error_fans_out_to_every_waiter() {
        let loader: BatchLoader<String, String> = BatchLoader::new(
            "users",
            batch_fn(|_keys: Vec<String>| async move {
                Err::<Vec<String>, BatchError>("connection reset".into())
            }),
            LoaderConfig::default(),
        )
        .expect("valid config");

        let results = loader
            .load_many(vec!["a".to_string(), "b".to_string(), "a".to_string()])
            .await;
        assert_eq!(results.len(), 3);
        for result in results {
            match result {
                Err(LoaderError::BatchExecution { loader, keys, reason }) => {
                    assert_eq!(loader, "users");
                    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
                    assert_eq!(reason, "connection reset");
                }
                other => panic!("expected batch failure, got {other:?}"),
            }
        }
        assert_eq!(loader.stats().failed_batches, 1);
    }

    #[tokio::test]
    async fn test_length_mismatch_is_shape_error() {
        let loader: BatchLoader<u32, u32> = BatchLoader::new(
            "broken",
            batch_fn(|keys: Vec<u32>| async move {
                Ok::<_, BatchError>(keys.into_iter().skip(1).collect())
            }),
            LoaderConfig::default(),
        )
        .expect("valid config");

        let results = loader.load_many(vec![1, 2, 3]).await;
        for result in results {
            assert!(matches!(
                result,
                Err(LoaderError::BatchShape {
                    expected: 3,
                    got: 2,
                    ..
                })
            ));
        }
        assert_eq!(loader.stats().persistent_cache_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_fails_batch() {
        let loader: BatchLoader<u32, u32> = BatchLoader::new(
            "slow",
            batch_fn(|keys: Vec<u32>| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, BatchError>(keys)
            }),
            LoaderConfig::default().with_batch_timeout(Duration::from_millis(100)),
        )
        .expect("valid config");

        match loader.load(1).await {
            Err(LoaderError::BatchExecution { reason, .. }) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_breaker_fails_without_calling_batch_fn() {
        let clock = ManualClock::starting_now();
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "postgres",
            CircuitBreakerConfig::new(1, Duration::from_secs(30)),
            clock.shared(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let loader: BatchLoader<u32, u32> = BatchLoader::builder(
            "rows",
            batch_fn(move |_keys: Vec<u32>| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<Vec<u32>, BatchError>("db down".into())
                }
            }),
        )
        .breaker(breaker.clone())
        .build()
        .expect("valid config");

        assert!(matches!(
            loader.load(1).await,
            Err(LoaderError::BatchExecution { .. })
        ));
        assert_eq!(breaker.state(), leadflow_guard::CircuitState::Open);

        let results = loader.load_many(vec![2, 3]).await;
        for result in results {
            match result {
                Err(LoaderError::CircuitOpen { source, keys, .. }) => {
                    assert_eq!(source.name, "postgres");
                    assert_eq!(keys, vec!["2".to_string(), "3".to_string()]);
                }
                other => panic!("expected circuit open, got {other:?}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_batch() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let loader: BatchLoader<u32, u32> = BatchLoader::new(
            "gated",
            batch_fn(move |keys: Vec<u32>| {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok::<_, BatchError>(keys.into_iter().map(|k| k + 100).collect())
                }
            }),
            LoaderConfig::default(),
        )
        .expect("valid config");

        let cancelled = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(1).await }
        });
        let survivor = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(2).await }
        });

        // Let both enqueue and the batch start, then cancel the first caller.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        cancelled.abort();
        let _ = release_tx.send(());

        assert_eq!(survivor.await.expect("task completes"), Ok(102));
        assert_eq!(loader.load(1).await, Ok(101), "cancelled key was still cached");
        assert_eq!(loader.stats().batches_executed, 1);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (loader, doubler) = doubler_loader(
            LoaderConfig::default().with_flush_delay(Duration::from_secs(3600)),
        );
        let pending = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(21).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(calls(&doubler).is_empty());

        loader.flush().await;
        assert_eq!(calls(&doubler), vec![vec![21]]);
        assert_eq!(pending.await.expect("task completes"), Ok(42));
    }

    #[tokio::test]
    async fn test_prime_and_clear() {
        let (loader, doubler) = doubler_loader(LoaderConfig::default());
        loader.prime(5, 500);
        assert_eq!(loader.load(5).await, Ok(500));
        assert!(calls(&doubler).is_empty());

        loader.clear(&5);
        assert_eq!(loader.load(5).await, Ok(10));
        assert_eq!(calls(&doubler).len(), 1);

        loader.clear_all();
        assert_eq!(loader.stats().persistent_cache_size, 0);
        assert_eq!(loader.stats().request_cache_size, 0);
    }

    #[tokio::test]
    async fn test_stats_hit_rate_and_namespace() {
        let (loader, _doubler) = doubler_loader(LoaderConfig::default());
        loader.load(1).await.expect("load succeeds");
        loader.load(1).await.expect("load succeeds");

        let stats = loader.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.namespace, "graphql:loader:doubler");
        assert_eq!(stats.max_batch_size, 500);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let doubler = Arc::new(Doubler::default());
        let config = LoaderConfig {
            batch_size: 0,
            ..LoaderConfig::default()
        };
        assert!(BatchLoader::new("bad", doubler, config).is_err());
    }
}
