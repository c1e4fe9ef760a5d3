//! Constants for the LeadFlow query optimizer
//!
//! Default values for every configuration section. Centralizing them keeps
//! `Default` impls and `from_env` fallbacks in sync.

// ============================================================================
// QUERY ADMISSION
// ============================================================================

/// Maximum brace-nesting depth admitted by the gate
pub const DEFAULT_MAX_QUERY_DEPTH: u32 = 7;

/// Maximum heuristic complexity score admitted by the gate
pub const DEFAULT_MAX_QUERY_COMPLEXITY: u32 = 100;

/// Execution time limit applied to the caller's execute function (5s)
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 5000;

/// TTL for cached query results (1 minute)
pub const DEFAULT_QUERY_CACHE_TTL_SECS: u64 = 60;

/// Prefix for query result cache keys
pub const QUERY_CACHE_KEY_PREFIX: &str = "graphql:query:";

// ============================================================================
// CACHE
// ============================================================================

/// Default TTL when `set` is called without one (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Capacity of the local (L1) cache
pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 10_000;

/// Default eviction policy name
pub const DEFAULT_EVICTION_POLICY: &str = "lru";

// ============================================================================
// BATCHING LOADER
// ============================================================================

/// Distinct pending keys that trigger an immediate batch dispatch
pub const DEFAULT_LOADER_BATCH_SIZE: usize = 100;

/// Hard cap on keys passed to one batch function call
pub const DEFAULT_LOADER_MAX_BATCH_SIZE: usize = 500;

/// TTL for the loader's persistent cache (5 minutes)
pub const DEFAULT_LOADER_CACHE_TTL_SECS: u64 = 300;

/// Capacity of the loader's persistent cache
pub const DEFAULT_LOADER_CACHE_SIZE: usize = 10_000;

/// Timeout applied to each batch function call
pub const DEFAULT_LOADER_BATCH_TIMEOUT_MS: u64 = 5000;

/// Prefix for loader persistent cache keys
pub const DEFAULT_LOADER_CACHE_KEY_PREFIX: &str = "graphql:loader";

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Failures before a breaker opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker waits before admitting a probe
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// RATE LIMITING
// ============================================================================

/// GraphQL endpoint class: 100 requests per minute, 5 minute block
pub const DEFAULT_GRAPHQL_WINDOW_SECS: u64 = 60;
pub const DEFAULT_GRAPHQL_MAX_REQUESTS: u32 = 100;
pub const DEFAULT_GRAPHQL_BLOCK_SECS: u64 = 300;

/// Auth endpoint class: 10 requests per hour, 1 hour block
pub const DEFAULT_AUTH_WINDOW_SECS: u64 = 3600;
pub const DEFAULT_AUTH_MAX_REQUESTS: u32 = 10;
pub const DEFAULT_AUTH_BLOCK_SECS: u64 = 3600;

/// General API endpoint class: 1000 requests per minute, 1 minute block
pub const DEFAULT_API_WINDOW_SECS: u64 = 60;
pub const DEFAULT_API_MAX_REQUESTS: u32 = 1000;
pub const DEFAULT_API_BLOCK_SECS: u64 = 60;

// ============================================================================
// MONITORING
// ============================================================================

/// Samples kept in the metrics ring buffer
pub const DEFAULT_METRICS_CAPACITY: usize = 10_000;

/// Interval of the periodic aggregation task
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

/// Rolling window covered by dashboard aggregates (5 minutes)
pub const DEFAULT_AGGREGATION_WINDOW_SECS: u64 = 300;

/// Queries slower than this raise a slow-query alert
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1000;

/// Error rate above which the dashboard reports degraded health
pub const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.05;
