//! LeadFlow Optimizer - query optimization façade
//!
//! [`QueryOptimizer`] runs each query through the admission gate, the
//! multi-level result cache and the caller's [`QueryExecutor`], recording a
//! [`QueryMetricsSample`] per query in the [`PerformanceMonitor`]. It owns
//! the breaker registry, loader registry and rate limiter shared by the
//! queries it serves.

pub mod cache_key;
pub mod executor;
pub mod monitor;
pub mod optimizer;

pub use cache_key::{canonical_json, normalize_query, query_cache_key, query_hash};
pub use executor::{executor_fn, ExecutedQuery, FnExecutor, QueryExecutor};
pub use monitor::{
    metrics_aggregation_task, AggregatedMetrics, Alert, AlertKind, AlertSink, PerformanceMonitor,
    QueryMetricsSample, TracingAlertSink,
};
pub use optimizer::{CachedResponse, Dashboard, OptimizerStats, QueryOptimizer, QueryOutcome};
