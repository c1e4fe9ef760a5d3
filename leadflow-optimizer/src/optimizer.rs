//! Query optimization façade.
//!
//! Per query: admission gate, cache lookup, execute on miss under the
//! configured time limit, cache write, metrics sample. The façade also owns
//! the shared guards (breaker registry, rate limiter) and the loader
//! registry so callers reach them through one handle instead of globals.
//!
//! Every query that reaches the executor starts by clearing the request
//! caches of all registered loaders. Loaders registered here are shared by
//! concurrently running queries, so their request caches are shared too;
//! queries that need strict per-query isolation should register their own
//! loader with [`LoaderRegistry::scoped`] or build one outside the registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leadflow_cache::{MultiLevelCache, MultiLevelStats};
use leadflow_core::{
    overall_status, system_clock, EndpointClass, ExecutionError, HealthCheck, HealthStatus,
    LeadflowError, LeadflowResult, OptimizerConfig, RateLimitExceeded, SharedClock, Timestamp,
};
use leadflow_guard::{
    operation_name, BreakerRegistry, CircuitState, ComplexityLevel, QueryAnalysis,
    QueryComplexityAnalyzer, RateLimitDecision, RateLimiter, RateLimiterStats,
};
use leadflow_loader::{LoaderRegistry, LoaderStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::cache_key::{query_cache_key, query_hash};
use crate::executor::{ExecutedQuery, QueryExecutor};
use crate::monitor::{AggregatedMetrics, AlertKind, PerformanceMonitor, QueryMetricsSample};

/// Slow queries listed on the dashboard.
const DASHBOARD_SLOW_QUERIES: usize = 10;

/// A query result as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub data: Value,
    /// How long the execution that produced `data` took.
    pub execution_ms: u64,
}

/// Result of [`QueryOptimizer::optimize`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub data: Value,
    /// True when served from cache without executing.
    pub cached: bool,
    pub analysis: QueryAnalysis,
    pub cache_key: String,
    pub execution_time: Duration,
}

/// Façade counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    pub queries_optimized: u64,
    pub cache_hits_served: u64,
    /// Sum of the original execution times of results served from cache.
    pub estimated_savings_ms: u64,
    pub rejections: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queries_optimized: AtomicU64,
    cache_hits_served: AtomicU64,
    estimated_savings_ms: AtomicU64,
    rejections: AtomicU64,
    errors: AtomicU64,
}

/// Everything the façade knows, in one serializable report.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub generated_at: Timestamp,
    pub status: HealthStatus,
    pub health: Vec<HealthCheck>,
    pub optimizer: OptimizerStats,
    pub cache: MultiLevelStats,
    pub cache_hit_rate: f64,
    pub metrics: AggregatedMetrics,
    pub slow_queries: Vec<QueryMetricsSample>,
    pub complexity_distribution: BTreeMap<ComplexityLevel, usize>,
    pub loaders: BTreeMap<String, LoaderStats>,
    pub circuits: BTreeMap<String, CircuitState>,
    pub rate_limiter: RateLimiterStats,
}

/// Query optimization façade.
#[derive(Debug)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
    analyzer: QueryComplexityAnalyzer,
    cache: MultiLevelCache<CachedResponse>,
    breakers: BreakerRegistry,
    loaders: Arc<LoaderRegistry>,
    rate_limiter: RateLimiter,
    monitor: Arc<PerformanceMonitor>,
    clock: SharedClock,
    counters: Counters,
}

impl QueryOptimizer {
    /// Create a façade from configuration using the system clock.
    ///
    /// Opens the LMDB tier when `cache.l2_path` is set.
    pub async fn new(config: OptimizerConfig) -> LeadflowResult<Self> {
        Self::from_config(config, system_clock()).await
    }

    pub async fn from_config(config: OptimizerConfig, clock: SharedClock) -> LeadflowResult<Self> {
        config.validate()?;
        let cache = MultiLevelCache::from_config(&config.cache, clock.clone()).await?;
        Self::with_cache(config, cache, clock)
    }

    /// Create a façade around an already built cache.
    pub fn with_cache(
        config: OptimizerConfig,
        cache: MultiLevelCache<CachedResponse>,
        clock: SharedClock,
    ) -> LeadflowResult<Self> {
        config.validate()?;
        Ok(Self {
            analyzer: QueryComplexityAnalyzer::from_config(&config.query),
            breakers: BreakerRegistry::new(config.circuit_breaker.clone(), clock.clone()),
            loaders: Arc::new(LoaderRegistry::new()),
            rate_limiter: RateLimiter::with_clock(config.rate_limit.clone(), clock.clone()),
            monitor: Arc::new(PerformanceMonitor::new(
                config.monitoring.clone(),
                clock.clone(),
            )),
            cache,
            config,
            clock,
            counters: Counters::default(),
        })
    }

    /// Create an L1-only façade.
    pub fn local_only(config: OptimizerConfig, clock: SharedClock) -> LeadflowResult<Self> {
        let cache = MultiLevelCache::local_only(&config.cache, clock.clone())?;
        Self::with_cache(config, cache, clock)
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &QueryComplexityAnalyzer {
        &self.analyzer
    }

    pub fn cache(&self) -> &MultiLevelCache<CachedResponse> {
        &self.cache
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn loaders(&self) -> &Arc<LoaderRegistry> {
        &self.loaders
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Rate limit check for the transport layer, separate from
    /// [`optimize`](Self::optimize).
    pub fn check_rate_limit(
        &self,
        identifier: &str,
        class: &EndpointClass,
    ) -> Result<RateLimitDecision, RateLimitExceeded> {
        self.rate_limiter.enforce(identifier, class)
    }

    /// Admit, look up, execute on miss and record one query.
    pub async fn optimize(
        &self,
        query: &str,
        variables: &Value,
        executor: &dyn QueryExecutor,
    ) -> LeadflowResult<QueryOutcome> {
        let started = Instant::now();
        let analysis = match self.analyzer.should_allow(query) {
            Ok(analysis) => analysis,
            Err(rejected) => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    depth = rejected.depth,
                    complexity = rejected.complexity,
                    reason = %rejected.reason,
                    "Query rejected by admission gate"
                );
                return Err(rejected.into());
            }
        };
        self.counters
            .queries_optimized
            .fetch_add(1, Ordering::Relaxed);

        let cache_key = query_cache_key(query, variables);
        let mut sample = QueryMetricsSample::new(query_hash(query), self.clock.now());
        sample.operation_name = operation_name(query);
        sample.complexity = analysis.level;

        if self.config.query.enable_query_caching {
            if let Some(hit) = self.cache.get(&cache_key).await {
                self.counters
                    .cache_hits_served
                    .fetch_add(1, Ordering::Relaxed);
                self.counters
                    .estimated_savings_ms
                    .fetch_add(hit.execution_ms, Ordering::Relaxed);
                let execution_time = started.elapsed();
                sample.execution_time = execution_time;
                sample.cache_hits = 1;
                self.monitor.record(sample);
                return Ok(QueryOutcome {
                    data: hit.data,
                    cached: true,
                    analysis,
                    cache_key,
                    execution_time,
                });
            }
        }
        sample.cache_misses = 1;

        // New unit of work: values from earlier queries must be refetched.
        self.loaders.clear_request_caches();

        let limit = self.config.query.max_execution_time;
        let executed = match tokio::time::timeout(limit, executor.execute(query, variables)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout { limit }.into()),
        };
        let execution_time = started.elapsed();
        sample.execution_time = execution_time;

        let executed: ExecutedQuery = match executed {
            Ok(executed) => executed,
            Err(e) => {
                self.record_failure(sample, &e);
                return Err(e);
            }
        };

        sample.resolver_count = executed.resolver_count;
        sample.db_queries = executed.db_queries;
        self.check_resource_usage(&sample);

        if self.config.query.enable_response_caching {
            let cached = CachedResponse {
                data: executed.data.clone(),
                execution_ms: u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
            };
            self.cache
                .set(&cache_key, cached, Some(self.config.query.cache_ttl))
                .await;
        }
        self.monitor.record(sample);

        Ok(QueryOutcome {
            data: executed.data,
            cached: false,
            analysis,
            cache_key,
            execution_time,
        })
    }

    fn record_failure(&self, mut sample: QueryMetricsSample, error: &LeadflowError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            operation = sample.operation_name.as_deref().unwrap_or("<anonymous>"),
            kind = ?error.kind(),
            error = %error,
            "Query execution failed"
        );
        sample.error_count = 1;
        self.monitor.record(sample);
    }

    fn check_resource_usage(&self, sample: &QueryMetricsSample) {
        let limits = &self.config.query;
        if sample.db_queries > limits.max_db_queries {
            self.monitor.raise(
                AlertKind::ResourceUsage,
                format!(
                    "Query issued {} backend calls (limit {})",
                    sample.db_queries, limits.max_db_queries
                ),
                &sample.query_hash,
            );
        }
        if sample.resolver_count > limits.max_resolvers {
            self.monitor.raise(
                AlertKind::ResourceUsage,
                format!(
                    "Query ran {} resolvers (limit {})",
                    sample.resolver_count, limits.max_resolvers
                ),
                &sample.query_hash,
            );
        }
    }

    /// Drop the cached result of `query` with `variables`.
    pub async fn invalidate(&self, query: &str, variables: &Value) -> bool {
        self.cache.delete(&query_cache_key(query, variables)).await
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            queries_optimized: self.counters.queries_optimized.load(Ordering::Relaxed),
            cache_hits_served: self.counters.cache_hits_served.load(Ordering::Relaxed),
            estimated_savings_ms: self.counters.estimated_savings_ms.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> Vec<HealthCheck> {
        vec![
            self.cache.health(),
            self.breakers.health(),
            self.monitor.health(),
        ]
    }

    /// Aggregate every component into one report.
    ///
    /// Runs a fresh metrics aggregation.
    pub fn dashboard(&self) -> Dashboard {
        let metrics = self.monitor.aggregate_now();
        let cache = self.cache.stats();
        let health = self.health();
        Dashboard {
            generated_at: self.clock.now(),
            status: overall_status(&health),
            health,
            optimizer: self.stats(),
            cache_hit_rate: cache.hit_rate(),
            cache,
            metrics,
            slow_queries: self.monitor.slow_queries(DASHBOARD_SLOW_QUERIES),
            complexity_distribution: self.monitor.complexity_distribution(),
            loaders: self.loaders.stats(),
            circuits: self.breakers.status(),
            rate_limiter: self.rate_limiter.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::executor_fn;
    use leadflow_core::{ManualClock, QueryConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn optimizer(query: QueryConfig) -> (QueryOptimizer, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = OptimizerConfig {
            query,
            ..OptimizerConfig::default()
        };
        let optimizer = QueryOptimizer::local_only(config, clock.shared()).expect("valid config");
        (optimizer, clock)
    }

    fn counting(calls: Arc<AtomicUsize>) -> impl QueryExecutor {
        executor_fn(move |_query: String, variables: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ExecutedQuery::new(json!({"leads": [variables]})).with_counts(3, 1))
            }
        })
    }

    const LEADS: &str = "query Leads($status: String) { leads(status: $status) { id name } }";

    #[tokio::test]
    async fn test_second_identical_query_is_cached() {
        let (optimizer, _clock) = optimizer(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());
        let vars = json!({"status": "new"});

        let first = optimizer
            .optimize(LEADS, &vars, &executor)
            .await
            .expect("first query succeeds");
        let second = optimizer
            .optimize(LEADS, &vars, &executor)
            .await
            .expect("second query succeeds");

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.data, second.data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = optimizer.stats();
        assert_eq!(stats.queries_optimized, 2);
        assert_eq!(stats.cache_hits_served, 1);
        assert_eq!(optimizer.monitor().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_query_never_executes_or_touches_cache() {
        let (optimizer, _clock) = optimizer(QueryConfig::default().with_limits(7, 1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());
        let deep = "query { a { b { c { d { e { f { g { h { i } } } } } } } } }";

        let err = optimizer
            .optimize(deep, &Value::Null, &executor)
            .await
            .expect_err("depth 9 is over the limit");
        match err {
            LeadflowError::Admission(rejected) => {
                assert_eq!(rejected.depth, 9);
                assert_eq!(rejected.max_depth, 7);
            }
            other => panic!("expected admission rejection, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let cache = optimizer.cache().stats();
        assert_eq!(cache.l1_hits + cache.l2_hits + cache.misses + cache.sets, 0);
        assert_eq!(optimizer.stats().rejections, 1);
        assert!(optimizer.monitor().is_empty());
    }

    #[tokio::test]
    async fn test_different_variables_execute_separately() {
        let (optimizer, _clock) = optimizer(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());

        optimizer
            .optimize(LEADS, &json!({"status": "new"}), &executor)
            .await
            .expect("query succeeds");
        optimizer
            .optimize(LEADS, &json!({"status": "won"}), &executor)
            .await
            .expect("query succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry_re_executes() {
        let (optimizer, clock) =
            optimizer(QueryConfig::default().with_cache_ttl(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());

        optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect("query succeeds");
        clock.advance(Duration::from_secs(31));
        let again = optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect("query succeeds");
        assert!(!again.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_caching_switches() {
        let query = QueryConfig {
            enable_response_caching: false,
            ..QueryConfig::default()
        };
        let (optimizer, _clock) = optimizer(query);
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());

        for _ in 0..2 {
            let outcome = optimizer
                .optimize(LEADS, &Value::Null, &executor)
                .await
                .expect("query succeeds");
            assert!(!outcome.cached);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(optimizer.cache().stats().sets, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (optimizer, _clock) = optimizer(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());

        optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect("query succeeds");
        assert!(optimizer.invalidate(LEADS, &Value::Null).await);
        optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect("query succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execution_error_is_recorded_and_returned() {
        let (optimizer, _clock) = optimizer(QueryConfig::default());
        let executor = executor_fn(|_query: String, _variables: Value| async move {
            Err::<ExecutedQuery, _>(LeadflowError::from(ExecutionError::failed("resolver blew up")))
        });

        let err = optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect_err("executor fails");
        assert!(matches!(err, LeadflowError::Execution(ExecutionError::Failed { .. })));
        assert_eq!(optimizer.stats().errors, 1);
        assert_eq!(optimizer.monitor().aggregate_now().error_count, 1);
        assert_eq!(optimizer.cache().stats().sets, 0, "failures are not cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_time_limit() {
        let (optimizer, _clock) = optimizer(
            QueryConfig::default().with_max_execution_time(Duration::from_millis(200)),
        );
        let executor = executor_fn(|_query: String, _variables: Value| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ExecutedQuery::new(Value::Null))
        });

        let err = optimizer
            .optimize(LEADS, &Value::Null, &executor)
            .await
            .expect_err("execution exceeds the limit");
        assert!(matches!(
            err,
            LeadflowError::Execution(ExecutionError::Timeout { .. })
        ));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_dashboard_aggregates_components() {
        let (optimizer, _clock) = optimizer(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = counting(calls.clone());
        optimizer.breakers().get_or_insert("postgres");

        for _ in 0..3 {
            optimizer
                .optimize(LEADS, &Value::Null, &executor)
                .await
                .expect("query succeeds");
        }
        optimizer
            .check_rate_limit("10.0.0.1", &EndpointClass::GraphQl)
            .expect("under the limit");

        let dashboard = optimizer.dashboard();
        assert_eq!(dashboard.status, HealthStatus::Healthy);
        assert_eq!(dashboard.optimizer.cache_hits_served, 2);
        assert_eq!(dashboard.metrics.total_queries, 3);
        assert!((dashboard.metrics.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(dashboard.circuits.get("postgres"), Some(&CircuitState::Closed));
        assert_eq!(dashboard.rate_limiter.tracked, 1);
        assert_eq!(dashboard.complexity_distribution[&ComplexityLevel::Medium], 3);

        let json = serde_json::to_value(&dashboard).expect("dashboard serializes");
        assert_eq!(json["circuits"]["postgres"], "closed");
    }
}
