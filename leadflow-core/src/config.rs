//! Configuration types
//!
//! Every section has defaults taken from [`crate::constants`], an optional
//! `from_env` override layer and a `validate` pass. Nothing here is read
//! lazily: components receive a validated copy at construction.

use crate::constants::*;
use crate::{ConfigError, LeadflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Read `name` from the environment and parse it, falling back to `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs_or(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis_or(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn require_positive(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, value, "must be greater than 0"));
    }
    Ok(())
}

fn require_nonzero_duration(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(invalid(field, format!("{:?}", value), "must be positive"));
    }
    Ok(())
}

// ============================================================================
// QUERY
// ============================================================================

/// Admission limits and result caching for query execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub max_depth: u32,
    pub max_complexity: u32,
    /// Time limit for the caller's execute function
    pub max_execution_time: Duration,
    /// Executions reporting more backend calls than this raise an alert
    pub max_db_queries: u32,
    /// Executions reporting more resolver calls than this raise an alert
    pub max_resolvers: u32,
    /// Serve results from cache when present
    pub enable_query_caching: bool,
    /// Store fresh results in cache
    pub enable_response_caching: bool,
    pub cache_ttl: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_QUERY_DEPTH,
            max_complexity: DEFAULT_MAX_QUERY_COMPLEXITY,
            max_execution_time: Duration::from_millis(DEFAULT_MAX_EXECUTION_TIME_MS),
            max_db_queries: 50,
            max_resolvers: 100,
            enable_query_caching: true,
            enable_response_caching: true,
            cache_ttl: Duration::from_secs(DEFAULT_QUERY_CACHE_TTL_SECS),
        }
    }
}

impl QueryConfig {
    /// Set the admission limits.
    pub fn with_limits(mut self, max_depth: u32, max_complexity: u32) -> Self {
        self.max_depth = max_depth;
        self.max_complexity = max_complexity;
        self
    }

    /// Set the result cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the execution time limit.
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LEADFLOW_QUERY_MAX_DEPTH` (default: 7)
    /// - `LEADFLOW_QUERY_MAX_COMPLEXITY` (default: 100)
    /// - `LEADFLOW_QUERY_MAX_EXECUTION_MS` (default: 5000)
    /// - `LEADFLOW_QUERY_CACHE_TTL_SECS` (default: 60)
    /// - `LEADFLOW_QUERY_CACHING` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_depth: env_or("LEADFLOW_QUERY_MAX_DEPTH", defaults.max_depth),
            max_complexity: env_or("LEADFLOW_QUERY_MAX_COMPLEXITY", defaults.max_complexity),
            max_execution_time: env_millis_or(
                "LEADFLOW_QUERY_MAX_EXECUTION_MS",
                defaults.max_execution_time,
            ),
            max_db_queries: env_or("LEADFLOW_QUERY_MAX_DB_QUERIES", defaults.max_db_queries),
            max_resolvers: env_or("LEADFLOW_QUERY_MAX_RESOLVERS", defaults.max_resolvers),
            enable_query_caching: env_or("LEADFLOW_QUERY_CACHING", defaults.enable_query_caching),
            enable_response_caching: env_or(
                "LEADFLOW_RESPONSE_CACHING",
                defaults.enable_response_caching,
            ),
            cache_ttl: env_secs_or("LEADFLOW_QUERY_CACHE_TTL_SECS", defaults.cache_ttl),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(invalid("query.max_depth", self.max_depth, "must be greater than 0"));
        }
        if self.max_complexity == 0 {
            return Err(invalid(
                "query.max_complexity",
                self.max_complexity,
                "must be greater than 0",
            ));
        }
        require_nonzero_duration("query.max_execution_time", self.max_execution_time)?;
        require_nonzero_duration("query.cache_ttl", self.cache_ttl)?;
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Recency policy used by the local cache when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the entry untouched longest; reads and writes both touch.
    #[default]
    Lru,
    /// Evict the entry inserted first; neither reads nor overwrites reorder.
    Fifo,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Fifo => "fifo",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(ConfigError::UnsupportedEvictionPolicy {
                policy: other.to_string(),
            }),
        }
    }
}

/// Multi-level cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used when `set` is called without one.
    pub default_ttl: Duration,
    /// Capacity of the local (L1) cache.
    pub local_cache_size: usize,
    pub eviction_policy: EvictionPolicy,
    /// Directory of an LMDB environment used as L2, if any.
    pub l2_path: Option<PathBuf>,
    /// Map size of the LMDB environment in megabytes.
    pub l2_max_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            local_cache_size: DEFAULT_LOCAL_CACHE_SIZE,
            eviction_policy: EvictionPolicy::Lru,
            l2_path: None,
            l2_max_size_mb: 100,
        }
    }
}

impl CacheConfig {
    pub fn with_local_size(mut self, size: usize) -> Self {
        self.local_cache_size = size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_l2_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.l2_path = Some(path.into());
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LEADFLOW_CACHE_DEFAULT_TTL_SECS` (default: 300)
    /// - `LEADFLOW_CACHE_LOCAL_SIZE` (default: 10000)
    /// - `LEADFLOW_CACHE_EVICTION_POLICY` (default: lru)
    /// - `LEADFLOW_CACHE_L2_PATH` (default: unset, L1 only)
    /// - `LEADFLOW_CACHE_L2_MAX_SIZE_MB` (default: 100)
    ///
    /// An unsupported eviction policy name is an error rather than a silent
    /// fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let eviction_policy = match std::env::var("LEADFLOW_CACHE_EVICTION_POLICY") {
            Ok(name) => name.parse()?,
            Err(_) => defaults.eviction_policy,
        };
        Ok(Self {
            default_ttl: env_secs_or("LEADFLOW_CACHE_DEFAULT_TTL_SECS", defaults.default_ttl),
            local_cache_size: env_or("LEADFLOW_CACHE_LOCAL_SIZE", defaults.local_cache_size),
            eviction_policy,
            l2_path: std::env::var("LEADFLOW_CACHE_L2_PATH").ok().map(PathBuf::from),
            l2_max_size_mb: env_or("LEADFLOW_CACHE_L2_MAX_SIZE_MB", defaults.l2_max_size_mb),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("cache.local_cache_size", self.local_cache_size)?;
        require_nonzero_duration("cache.default_ttl", self.default_ttl)?;
        if self.l2_path.is_some() {
            require_positive("cache.l2_max_size_mb", self.l2_max_size_mb)?;
        }
        Ok(())
    }
}

// ============================================================================
// BATCHING LOADER
// ============================================================================

/// Batching loader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Distinct pending keys that trigger an immediate dispatch.
    pub batch_size: usize,
    /// Upper bound on keys per batch function call.
    pub max_batch_size: usize,
    pub cache_ttl: Duration,
    /// Capacity of the persistent cache.
    pub cache_size: usize,
    pub enable_request_cache: bool,
    pub enable_persistent_cache: bool,
    pub cache_key_prefix: String,
    /// Time limit for one batch function call.
    pub batch_timeout: Duration,
    /// Extra delay after the end-of-tick yield before a partial batch is
    /// dispatched. Zero dispatches as soon as the scheduler runs the flush.
    pub flush_delay: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_LOADER_BATCH_SIZE,
            max_batch_size: DEFAULT_LOADER_MAX_BATCH_SIZE,
            cache_ttl: Duration::from_secs(DEFAULT_LOADER_CACHE_TTL_SECS),
            cache_size: DEFAULT_LOADER_CACHE_SIZE,
            enable_request_cache: true,
            enable_persistent_cache: true,
            cache_key_prefix: DEFAULT_LOADER_CACHE_KEY_PREFIX.to_string(),
            batch_timeout: Duration::from_millis(DEFAULT_LOADER_BATCH_TIMEOUT_MS),
            flush_delay: Duration::ZERO,
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn with_persistent_cache(mut self, enabled: bool) -> Self {
        self.enable_persistent_cache = enabled;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LEADFLOW_LOADER_BATCH_SIZE` (default: 100)
    /// - `LEADFLOW_LOADER_MAX_BATCH_SIZE` (default: 500)
    /// - `LEADFLOW_LOADER_CACHE_TTL_SECS` (default: 300)
    /// - `LEADFLOW_LOADER_BATCH_TIMEOUT_MS` (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("LEADFLOW_LOADER_BATCH_SIZE", defaults.batch_size),
            max_batch_size: env_or("LEADFLOW_LOADER_MAX_BATCH_SIZE", defaults.max_batch_size),
            cache_ttl: env_secs_or("LEADFLOW_LOADER_CACHE_TTL_SECS", defaults.cache_ttl),
            cache_size: env_or("LEADFLOW_LOADER_CACHE_SIZE", defaults.cache_size),
            batch_timeout: env_millis_or(
                "LEADFLOW_LOADER_BATCH_TIMEOUT_MS",
                defaults.batch_timeout,
            ),
            flush_delay: env_millis_or("LEADFLOW_LOADER_FLUSH_DELAY_MS", defaults.flush_delay),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("loader.batch_size", self.batch_size)?;
        require_positive("loader.max_batch_size", self.max_batch_size)?;
        require_positive("loader.cache_size", self.cache_size)?;
        if self.batch_size > self.max_batch_size {
            return Err(invalid(
                "loader.batch_size",
                self.batch_size,
                "must not exceed loader.max_batch_size",
            ));
        }
        require_nonzero_duration("loader.cache_ttl", self.cache_ttl)?;
        require_nonzero_duration("loader.batch_timeout", self.batch_timeout)?;
        Ok(())
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Configuration for circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Clear the failure count on any success while closed.
    pub reset_on_success: bool,
    /// Time limit for the protected call; a timeout counts as a failure.
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS),
            reset_on_success: false,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            ..Self::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_reset_on_success(mut self, enabled: bool) -> Self {
        self.reset_on_success = enabled;
        self
    }

    /// Create CircuitBreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `LEADFLOW_CIRCUIT_FAILURE_THRESHOLD`: Number of failures before opening (default: 5)
    /// - `LEADFLOW_CIRCUIT_RECOVERY_SECS`: How long circuit stays open (default: 30)
    /// - `LEADFLOW_CIRCUIT_CALL_TIMEOUT_MS`: Protected call time limit (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_or(
                "LEADFLOW_CIRCUIT_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            ),
            recovery_timeout: env_secs_or(
                "LEADFLOW_CIRCUIT_RECOVERY_SECS",
                defaults.recovery_timeout,
            ),
            reset_on_success: env_or(
                "LEADFLOW_CIRCUIT_RESET_ON_SUCCESS",
                defaults.reset_on_success,
            ),
            call_timeout: std::env::var("LEADFLOW_CIRCUIT_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold",
                self.failure_threshold,
                "must be greater than 0",
            ));
        }
        if let Some(timeout) = self.call_timeout {
            require_nonzero_duration("circuit_breaker.call_timeout", timeout)?;
        }
        Ok(())
    }
}

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Endpoint class a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EndpointClass {
    GraphQl,
    Auth,
    Api,
    Custom(String),
}

impl EndpointClass {
    pub fn as_str(&self) -> &str {
        match self {
            EndpointClass::GraphQl => "graphql",
            EndpointClass::Auth => "auth",
            EndpointClass::Api => "api",
            EndpointClass::Custom(name) => name,
        }
    }
}

impl From<&str> for EndpointClass {
    fn from(s: &str) -> Self {
        match s {
            "graphql" => EndpointClass::GraphQl,
            "auth" => EndpointClass::Auth,
            "api" => EndpointClass::Api,
            other => EndpointClass::Custom(other.to_string()),
        }
    }
}

impl From<String> for EndpointClass {
    fn from(s: String) -> Self {
        EndpointClass::from(s.as_str())
    }
}

impl From<EndpointClass> for String {
    fn from(class: EndpointClass) -> Self {
        class.as_str().to_string()
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window, quota and block duration for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub window: Duration,
    pub max_requests: u32,
    pub block_duration: Duration,
}

impl EndpointLimit {
    pub fn new(window: Duration, max_requests: u32, block_duration: Duration) -> Self {
        Self {
            window,
            max_requests,
            block_duration,
        }
    }

    fn api_default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_API_WINDOW_SECS),
            DEFAULT_API_MAX_REQUESTS,
            Duration::from_secs(DEFAULT_API_BLOCK_SECS),
        )
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Limits keyed by endpoint class name.
    pub endpoints: BTreeMap<String, EndpointLimit>,
    /// Identifiers that bypass every check.
    pub allow_list: BTreeSet<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            EndpointClass::GraphQl.to_string(),
            EndpointLimit::new(
                Duration::from_secs(DEFAULT_GRAPHQL_WINDOW_SECS),
                DEFAULT_GRAPHQL_MAX_REQUESTS,
                Duration::from_secs(DEFAULT_GRAPHQL_BLOCK_SECS),
            ),
        );
        endpoints.insert(
            EndpointClass::Auth.to_string(),
            EndpointLimit::new(
                Duration::from_secs(DEFAULT_AUTH_WINDOW_SECS),
                DEFAULT_AUTH_MAX_REQUESTS,
                Duration::from_secs(DEFAULT_AUTH_BLOCK_SECS),
            ),
        );
        endpoints.insert(EndpointClass::Api.to_string(), EndpointLimit::api_default());

        Self {
            enabled: true,
            endpoints,
            allow_list: BTreeSet::new(),
        }
    }
}

impl RateLimitConfig {
    /// Override or add the limit for an endpoint class.
    pub fn with_endpoint(mut self, class: impl Into<EndpointClass>, limit: EndpointLimit) -> Self {
        self.endpoints.insert(class.into().to_string(), limit);
        self
    }

    pub fn with_allowed(mut self, identifier: impl Into<String>) -> Self {
        self.allow_list.insert(identifier.into());
        self
    }

    /// Limit for `class`, falling back to the `api` class for unknown names.
    pub fn limit_for(&self, class: &EndpointClass) -> EndpointLimit {
        self.endpoints
            .get(class.as_str())
            .or_else(|| self.endpoints.get(EndpointClass::Api.as_str()))
            .copied()
            .unwrap_or_else(EndpointLimit::api_default)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LEADFLOW_RATE_LIMIT_ENABLED` (default: true)
    /// - `LEADFLOW_RATE_LIMIT_ALLOW_LIST`: comma-separated identifiers
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let allow_list = std::env::var("LEADFLOW_RATE_LIMIT_ALLOW_LIST")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.allow_list);
        Self {
            enabled: env_or("LEADFLOW_RATE_LIMIT_ENABLED", defaults.enabled),
            endpoints: defaults.endpoints,
            allow_list,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limit) in &self.endpoints {
            if limit.max_requests == 0 {
                return Err(invalid(
                    &format!("rate_limit.endpoints.{}.max_requests", name),
                    limit.max_requests,
                    "must be greater than 0",
                ));
            }
            require_nonzero_duration(&format!("rate_limit.endpoints.{}.window", name), limit.window)?;
        }
        Ok(())
    }
}

// ============================================================================
// MONITORING
// ============================================================================

/// Metrics ring and alerting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    /// Samples kept in the ring buffer.
    pub metrics_capacity: usize,
    /// Interval of the periodic aggregation task.
    pub metrics_interval: Duration,
    /// Rolling window covered by aggregates.
    pub aggregation_window: Duration,
    pub slow_query_threshold: Duration,
    pub error_rate_threshold: f64,
    pub enable_alerting: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            aggregation_window: Duration::from_secs(DEFAULT_AGGREGATION_WINDOW_SECS),
            slow_query_threshold: Duration::from_millis(DEFAULT_SLOW_QUERY_THRESHOLD_MS),
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
            enable_alerting: true,
        }
    }
}

impl MonitoringConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LEADFLOW_METRICS_ENABLED` (default: true)
    /// - `LEADFLOW_METRICS_CAPACITY` (default: 10000)
    /// - `LEADFLOW_METRICS_INTERVAL_SECS` (default: 60)
    /// - `LEADFLOW_METRICS_WINDOW_SECS` (default: 300)
    /// - `LEADFLOW_SLOW_QUERY_THRESHOLD_MS` (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_metrics: env_or("LEADFLOW_METRICS_ENABLED", defaults.enable_metrics),
            metrics_capacity: env_or("LEADFLOW_METRICS_CAPACITY", defaults.metrics_capacity),
            metrics_interval: env_secs_or(
                "LEADFLOW_METRICS_INTERVAL_SECS",
                defaults.metrics_interval,
            ),
            aggregation_window: env_secs_or(
                "LEADFLOW_METRICS_WINDOW_SECS",
                defaults.aggregation_window,
            ),
            slow_query_threshold: env_millis_or(
                "LEADFLOW_SLOW_QUERY_THRESHOLD_MS",
                defaults.slow_query_threshold,
            ),
            error_rate_threshold: env_or(
                "LEADFLOW_ERROR_RATE_THRESHOLD",
                defaults.error_rate_threshold,
            ),
            enable_alerting: env_or("LEADFLOW_ALERTING_ENABLED", defaults.enable_alerting),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("monitoring.metrics_capacity", self.metrics_capacity)?;
        require_nonzero_duration("monitoring.metrics_interval", self.metrics_interval)?;
        require_nonzero_duration("monitoring.aggregation_window", self.aggregation_window)?;
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(invalid(
                "monitoring.error_rate_threshold",
                self.error_rate_threshold,
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration for the optimization middleware.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub query: QueryConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub monitoring: MonitoringConfig,
}

impl OptimizerConfig {
    /// Create every section from environment variables.
    pub fn from_env() -> LeadflowResult<Self> {
        Ok(Self {
            query: QueryConfig::from_env(),
            cache: CacheConfig::from_env()?,
            loader: LoaderConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            monitoring: MonitoringConfig::from_env(),
        })
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(LeadflowError::Config) on the first
    /// invalid field.
    pub fn validate(&self) -> LeadflowResult<()> {
        self.query.validate()?;
        self.cache.validate()?;
        self.loader.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}
