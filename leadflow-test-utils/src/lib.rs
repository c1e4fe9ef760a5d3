//! LeadFlow Test Utilities
//!
//! Centralized test infrastructure for the LeadFlow workspace:
//! - Mock L2 store with failure switches
//! - Recording batch functions, counting executors, alert recorders
//! - Proptest generators for queries, variables and cache operations
//! - Fixtures and custom assertions
//! - Tracing setup for tests

// Re-export core types for convenience
pub use leadflow_core::{
    CacheConfig, CacheError, CircuitBreakerConfig, EndpointClass, EndpointLimit, LeadflowError,
    LeadflowResult, LoaderConfig, LoaderError, ManualClock, MonitoringConfig, OptimizerConfig,
    QueryConfig, RateLimitConfig, SharedClock, Timestamp,
};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use async_trait::async_trait;
use leadflow_cache::{InMemoryStore, L2Store};
use leadflow_loader::{BatchError, BatchFn};
use leadflow_optimizer::{Alert, AlertKind, AlertSink, ExecutedQuery, QueryExecutor};
use serde_json::{json, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-writer subscriber honoring `RUST_LOG` (default `warn`).
///
/// Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// MOCK L2 STORE
// ============================================================================

/// In-memory [`L2Store`] whose operations can be switched to fail.
#[derive(Debug)]
pub struct MockL2Store {
    inner: InMemoryStore,
    fail_ping: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
}

impl MockL2Store {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: InMemoryStore::with_clock(clock),
            fail_ping: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// A store that fails its startup ping.
    pub fn unreachable(clock: SharedClock) -> Self {
        let store = Self::new(clock);
        store.set_fail_ping(true);
        store
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// This store as the trait object the caches take.
    pub fn as_l2(self: &Arc<Self>) -> Arc<dyn L2Store> {
        let store: Arc<dyn L2Store> = self.clone();
        store
    }

    fn failure(operation: &str) -> CacheError {
        CacheError::Backend {
            operation: operation.to_string(),
            reason: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl L2Store for MockL2Store {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(CacheError::BackendUnavailable {
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::failure("get"));
        }
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::failure("set_ex"));
        }
        self.inner.set_ex(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::failure("delete"));
        }
        self.inner.delete(key).await
    }
}

// ============================================================================
// RECORDING BATCH FUNCTION
// ============================================================================

type ValueFn<K, V> = dyn Fn(&K) -> V + Send + Sync;

struct RecordingInner<K, V> {
    calls: Mutex<Vec<Vec<K>>>,
    value_of: Box<ValueFn<K, V>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

/// [`BatchFn`] that maps each key through a function and records every
/// call's key list. Clones share the record.
pub struct RecordingBatchFn<K, V> {
    inner: Arc<RecordingInner<K, V>>,
}

impl<K, V> Clone for RecordingBatchFn<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for RecordingBatchFn<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingBatchFn")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl<K, V> RecordingBatchFn<K, V> {
    pub fn new(value_of: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(RecordingInner {
                calls: Mutex::new(Vec::new()),
                value_of: Box::new(value_of),
                failing: AtomicBool::new(false),
                delay: Mutex::new(None),
            }),
        }
    }

    /// Make every later call fail for the whole batch.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Sleep for `delay` (Tokio time) before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.inner.delay) = delay;
    }

    pub fn call_count(&self) -> usize {
        lock(&self.inner.calls).len()
    }
}

impl<K: Clone, V> RecordingBatchFn<K, V> {
    /// Key lists of every call so far, in call order.
    pub fn calls(&self) -> Vec<Vec<K>> {
        lock(&self.inner.calls).clone()
    }
}

#[async_trait]
impl<K, V> BatchFn<K, V> for RecordingBatchFn<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    async fn load(&self, keys: &[K]) -> Result<Vec<V>, BatchError> {
        lock(&self.inner.calls).push(keys.to_vec());
        let delay = *lock(&self.inner.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err("injected batch failure".into());
        }
        Ok(keys.iter().map(|k| (self.inner.value_of)(k)).collect())
    }
}

// ============================================================================
// COUNTING EXECUTOR
// ============================================================================

/// [`QueryExecutor`] that counts calls and echoes the variables back.
#[derive(Debug, Default)]
pub struct CountingExecutor {
    calls: AtomicUsize,
    failing: AtomicBool,
    resolver_count: u32,
    db_queries: u32,
}

impl CountingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these counts with every result.
    pub fn with_counts(mut self, resolver_count: u32, db_queries: u32) -> Self {
        self.resolver_count = resolver_count;
        self.db_queries = db_queries;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn execute(&self, query: &str, variables: &Value) -> LeadflowResult<ExecutedQuery> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(leadflow_core::ExecutionError::failed("injected execution failure").into());
        }
        Ok(ExecutedQuery::new(json!({
            "query": query,
            "variables": variables,
            "call": call,
        }))
        .with_counts(self.resolver_count, self.db_queries))
    }
}

// ============================================================================
// RECORDING ALERT SINK
// ============================================================================

/// [`AlertSink`] that keeps every alert.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        lock(&self.alerts).iter().map(|a| a.kind).collect()
    }
}

impl AlertSink for RecordingAlertSink {
    fn alert(&self, alert: &Alert) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating test data.

    use super::*;
    use proptest::prelude::*;

    /// One operation against a string-keyed cache.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CacheOp {
        Set(u8, u32),
        Get(u8),
        Delete(u8),
    }

    /// Cache operations over a small key space so keys collide often.
    pub fn arb_cache_op(keys: u8) -> impl Strategy<Value = CacheOp> {
        let keys = keys.max(1);
        prop_oneof![
            3 => (0..keys, any::<u32>()).prop_map(|(k, v)| CacheOp::Set(k, v)),
            3 => (0..keys).prop_map(CacheOp::Get),
            1 => (0..keys).prop_map(CacheOp::Delete),
        ]
    }

    pub fn arb_cache_ops(keys: u8, len: usize) -> impl Strategy<Value = Vec<CacheOp>> {
        prop::collection::vec(arb_cache_op(keys), 0..len)
    }

    /// A query nested exactly `depth` selection sets deep.
    pub fn nested_query(depth: usize) -> String {
        let mut q = String::from("query Nested ");
        for i in 0..depth {
            q.push_str(&format!("{{ field{} ", i));
        }
        for _ in 0..depth {
            q.push_str("} ");
        }
        q
    }

    /// `(depth, query)` pairs for depths in `range`.
    pub fn arb_nested_query(
        range: std::ops::Range<usize>,
    ) -> impl Strategy<Value = (usize, String)> {
        range.prop_map(|depth| (depth, nested_query(depth)))
    }

    /// Flat JSON object of scalar variables.
    pub fn arb_variables() -> impl Strategy<Value = Value> {
        prop::collection::btree_map(
            "[a-z]{1,8}",
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                Just(Value::Null),
            ],
            0..6,
        )
        .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    pub fn arb_endpoint_class() -> impl Strategy<Value = EndpointClass> {
        prop_oneof![
            Just(EndpointClass::GraphQl),
            Just(EndpointClass::Auth),
            Just(EndpointClass::Api),
            "[a-z]{3,10}".prop_map(EndpointClass::from),
        ]
    }

    pub fn arb_identifier() -> impl Strategy<Value = String> {
        (1u8..=254, 1u8..=254).prop_map(|(a, b)| format!("10.0.{}.{}", a, b))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configurations and clocks for common scenarios.

    use super::*;

    /// A manual clock and its shared handle.
    pub fn manual_clock() -> (ManualClock, SharedClock) {
        let clock = ManualClock::starting_now();
        let shared = clock.shared();
        (clock, shared)
    }

    /// Small, fast configuration for tests.
    pub fn test_config() -> OptimizerConfig {
        OptimizerConfig {
            query: QueryConfig::default()
                .with_limits(7, 1000)
                .with_cache_ttl(Duration::from_secs(60))
                .with_max_execution_time(Duration::from_secs(2)),
            cache: CacheConfig::default()
                .with_local_size(64)
                .with_default_ttl(Duration::from_secs(60)),
            loader: LoaderConfig::default()
                .with_batch_size(16)
                .with_batch_timeout(Duration::from_secs(1)),
            circuit_breaker: CircuitBreakerConfig::new(3, Duration::from_secs(30)),
            rate_limit: RateLimitConfig::default().with_endpoint(
                EndpointClass::GraphQl,
                EndpointLimit::new(Duration::from_secs(60), 3, Duration::from_secs(120)),
            ),
            monitoring: MonitoringConfig::default()
                .with_capacity(100)
                .with_slow_query_threshold(Duration::from_millis(500)),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on LeadFlow error kinds.

    use super::*;

    /// Assert that a LeadflowResult is an admission rejection.
    #[track_caller]
    pub fn assert_admission_rejected<T: fmt::Debug>(result: &LeadflowResult<T>) {
        match result {
            Err(LeadflowError::Admission(_)) => {}
            other => panic!("Expected Admission error, got: {:?}", other),
        }
    }

    /// Assert that a LeadflowResult is a rate limit rejection.
    #[track_caller]
    pub fn assert_rate_limited<T: fmt::Debug>(result: &LeadflowResult<T>) {
        match result {
            Err(LeadflowError::RateLimited(_)) => {}
            other => panic!("Expected RateLimited error, got: {:?}", other),
        }
    }

    /// Assert that a load failed because the batch function failed.
    #[track_caller]
    pub fn assert_batch_failed<T: fmt::Debug>(result: &Result<T, LoaderError>) {
        match result {
            Err(LoaderError::BatchExecution { .. }) => {}
            other => panic!("Expected BatchExecution error, got: {:?}", other),
        }
    }

    /// Assert that a load was rejected by an open circuit.
    #[track_caller]
    pub fn assert_circuit_open<T: fmt::Debug>(result: &Result<T, LoaderError>) {
        match result {
            Err(LoaderError::CircuitOpen { .. }) => {}
            other => panic!("Expected CircuitOpen error, got: {:?}", other),
        }
    }
}
