//! Query performance monitor.
//!
//! Keeps a bounded ring of [`QueryMetricsSample`]s, raises alerts for slow
//! or failing queries, and aggregates rolling totals over a recent window.
//! Aggregation runs on demand ([`PerformanceMonitor::aggregate_now`]) or from
//! [`metrics_aggregation_task`] on a timer.

use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_core::{
    elapsed_between, to_chrono, HealthCheck, LeadflowResult, MonitoringConfig, SharedClock,
    Timestamp,
};
use leadflow_guard::ComplexityLevel;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

/// Cost signals of one optimized query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetricsSample {
    pub id: Uuid,
    pub query_hash: String,
    pub operation_name: Option<String>,
    pub execution_time: Duration,
    pub resolver_count: u32,
    pub db_queries: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub error_count: u32,
    pub complexity: ComplexityLevel,
    pub recorded_at: Timestamp,
}

impl QueryMetricsSample {
    pub fn new(query_hash: impl Into<String>, recorded_at: Timestamp) -> Self {
        Self {
            id: Uuid::now_v7(),
            query_hash: query_hash.into(),
            operation_name: None,
            execution_time: Duration::ZERO,
            resolver_count: 0,
            db_queries: 0,
            cache_hits: 0,
            cache_misses: 0,
            error_count: 0,
            complexity: ComplexityLevel::Low,
            recorded_at,
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            f64::from(self.cache_hits) / f64::from(total)
        }
    }

    /// Relative cost: `db*2 + resolvers + ms/10 + errors*5`.
    pub fn cost_score(&self) -> f64 {
        f64::from(self.db_queries) * 2.0
            + f64::from(self.resolver_count)
            + self.execution_time.as_secs_f64() * 1000.0 / 10.0
            + f64::from(self.error_count) * 5.0
    }
}

/// What triggered an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowQuery,
    QueryErrors,
    ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub query_hash: String,
    pub raised_at: Timestamp,
}

/// Receiver of monitor alerts.
///
/// Errors are logged and otherwise ignored; a failing sink never affects
/// the query that triggered it.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &Alert) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Logs alerts at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: &Alert) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::warn!(
            kind = ?alert.kind,
            query_hash = %alert.query_hash,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Rolling totals over the aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub total_queries: usize,
    pub avg_execution_ms: f64,
    pub max_execution_ms: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    /// Queries per second over the window.
    pub throughput: f64,
    pub avg_cost_score: f64,
    pub slow_query_count: usize,
}

/// Metrics ring, alerting and aggregation.
pub struct PerformanceMonitor {
    config: MonitoringConfig,
    samples: Mutex<VecDeque<QueryMetricsSample>>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    latest: Mutex<Option<AggregatedMetrics>>,
    alerts_raised: AtomicU64,
    clock: SharedClock,
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .field("samples", &self.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PerformanceMonitor {
    pub fn new(config: MonitoringConfig, clock: SharedClock) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
            sinks: RwLock::new(Vec::new()),
            latest: Mutex::new(None),
            alerts_raised: AtomicU64::new(0),
            clock,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Append a sample, dropping the oldest once the ring is full, and
    /// raise alerts for it.
    pub fn record(&self, sample: QueryMetricsSample) {
        if !self.config.enable_metrics {
            return;
        }
        let slow = sample.execution_time > self.config.slow_query_threshold;
        let alerts = [
            slow.then(|| {
                (
                    AlertKind::SlowQuery,
                    format!(
                        "Slow query {} took {}ms (threshold {}ms)",
                        sample.operation_name.as_deref().unwrap_or("<anonymous>"),
                        sample.execution_time.as_millis(),
                        self.config.slow_query_threshold.as_millis()
                    ),
                )
            }),
            (sample.error_count > 0).then(|| {
                (
                    AlertKind::QueryErrors,
                    format!(
                        "Query {} failed with {} error(s)",
                        sample.operation_name.as_deref().unwrap_or("<anonymous>"),
                        sample.error_count
                    ),
                )
            }),
        ];
        let query_hash = sample.query_hash.clone();

        {
            let mut samples = lock(&self.samples);
            samples.push_back(sample);
            while samples.len() > self.config.metrics_capacity {
                samples.pop_front();
            }
        }

        for (kind, message) in alerts.into_iter().flatten() {
            self.raise(kind, message, &query_hash);
        }
    }

    /// Send an alert to every sink when alerting is enabled.
    pub fn raise(&self, kind: AlertKind, message: String, query_hash: &str) {
        if !self.config.enable_alerting {
            return;
        }
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        let alert = Alert {
            kind,
            message,
            query_hash: query_hash.to_string(),
            raised_at: self.clock.now(),
        };
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for sink in sinks {
            if let Err(e) = sink.alert(&alert) {
                tracing::warn!(error = %e, kind = ?alert.kind, "Alert sink failed");
            }
        }
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.samples).is_empty()
    }

    /// Compute totals over the last `aggregation_window` and keep them as
    /// the latest aggregate.
    pub fn aggregate_now(&self) -> AggregatedMetrics {
        let now = self.clock.now();
        let window = self.config.aggregation_window;
        let window_start = now
            .checked_sub_signed(to_chrono(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut total = 0usize;
        let mut exec_ms_sum = 0.0;
        let mut exec_ms_max: f64 = 0.0;
        let mut errors = 0u64;
        let mut failed_queries = 0usize;
        let mut hits = 0u64;
        let mut lookups = 0u64;
        let mut cost_sum = 0.0;
        let mut slow = 0usize;

        for sample in lock(&self.samples)
            .iter()
            .filter(|s| s.recorded_at > window_start && s.recorded_at <= now)
        {
            let ms = sample.execution_time.as_secs_f64() * 1000.0;
            total += 1;
            exec_ms_sum += ms;
            exec_ms_max = exec_ms_max.max(ms);
            errors += u64::from(sample.error_count);
            if sample.error_count > 0 {
                failed_queries += 1;
            }
            hits += u64::from(sample.cache_hits);
            lookups += u64::from(sample.cache_hits) + u64::from(sample.cache_misses);
            cost_sum += sample.cost_score();
            if sample.execution_time > self.config.slow_query_threshold {
                slow += 1;
            }
        }

        let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { num / den };
        let aggregate = AggregatedMetrics {
            window_start,
            window_end: now,
            total_queries: total,
            avg_execution_ms: ratio(exec_ms_sum, total as f64),
            max_execution_ms: exec_ms_max,
            error_count: errors,
            error_rate: ratio(failed_queries as f64, total as f64),
            cache_hit_rate: ratio(hits as f64, lookups as f64),
            throughput: ratio(total as f64, window.as_secs_f64()),
            avg_cost_score: ratio(cost_sum, total as f64),
            slow_query_count: slow,
        };
        tracing::debug!(
            total_queries = aggregate.total_queries,
            error_rate = aggregate.error_rate,
            cache_hit_rate = aggregate.cache_hit_rate,
            "Aggregated query metrics"
        );
        *lock(&self.latest) = Some(aggregate.clone());
        aggregate
    }

    /// The aggregate computed by the last [`aggregate_now`](Self::aggregate_now).
    pub fn latest(&self) -> Option<AggregatedMetrics> {
        lock(&self.latest).clone()
    }

    /// Slowest samples over the slow-query threshold, slowest first.
    pub fn slow_queries(&self, limit: usize) -> Vec<QueryMetricsSample> {
        let mut slow: Vec<_> = lock(&self.samples)
            .iter()
            .filter(|s| s.execution_time > self.config.slow_query_threshold)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.execution_time.cmp(&a.execution_time));
        slow.truncate(limit);
        slow
    }

    /// Sample count per complexity level, every level present.
    pub fn complexity_distribution(&self) -> BTreeMap<ComplexityLevel, usize> {
        let mut distribution: BTreeMap<_, _> =
            ComplexityLevel::ALL.iter().map(|level| (*level, 0)).collect();
        for sample in lock(&self.samples).iter() {
            *distribution.entry(sample.complexity).or_insert(0) += 1;
        }
        distribution
    }

    /// Samples recorded within the last `within`.
    pub fn recent_count(&self, within: Duration) -> usize {
        let now = self.clock.now();
        lock(&self.samples)
            .iter()
            .filter(|s| s.recorded_at <= now && elapsed_between(s.recorded_at, now) < within)
            .count()
    }

    /// Degraded when the latest aggregate's error rate is over threshold.
    pub fn health(&self) -> HealthCheck {
        let check = match self.latest() {
            Some(latest) if latest.error_rate > self.config.error_rate_threshold => {
                HealthCheck::degraded(
                    "monitor",
                    format!(
                        "error rate {:.2} over threshold {:.2}",
                        latest.error_rate, self.config.error_rate_threshold
                    ),
                )
                .with_metadata("error_rate", serde_json::json!(latest.error_rate))
            }
            _ => HealthCheck::healthy("monitor"),
        };
        check.with_metadata("samples", serde_json::json!(self.len()))
    }
}

/// Aggregate `monitor` every `metrics_interval` of its configuration until
/// `shutdown_rx` carries `true`.
///
/// Returns the number of aggregation cycles run, or the configuration error
/// if the monitor's configuration is invalid (for example a zero interval).
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(metrics_aggregation_task(monitor.clone(), shutdown_rx));
/// // ...
/// let _ = shutdown_tx.send(true);
/// let cycles = handle.await??;
/// ```
pub async fn metrics_aggregation_task(
    monitor: Arc<PerformanceMonitor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> LeadflowResult<u64> {
    monitor.config().validate()?;
    let every = monitor.config().metrics_interval;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0u64;

    tracing::info!(
        interval_secs = every.as_secs(),
        "Metrics aggregation task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Metrics aggregation task shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                monitor.aggregate_now();
                cycles += 1;
            }
        }
    }

    tracing::info!(cycles, "Metrics aggregation task completed");
    Ok(cycles)
}
