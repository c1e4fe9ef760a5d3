//! Circuit breaker for protected backend calls.
//!
//! State machine:
//!
//! ```text
//! Closed --failures >= threshold--> Open
//! Open --recovery timeout elapsed--> HalfOpen   (checked lazily on read/call)
//! HalfOpen --probe succeeds--> Closed            (failure count reset)
//! HalfOpen --probe fails--> Open                 (last failure refreshed)
//! ```
//!
//! Exactly one probe is admitted while half-open. Other callers are rejected
//! as if the circuit were open until the probe resolves. A probe whose
//! future is dropped before completing releases its slot without changing
//! state, so the next caller becomes the probe.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use leadflow_core::{
    add_duration, elapsed_between, system_clock, CircuitBreakerConfig, CircuitOpenError,
    ExecutionError, HealthCheck, LeadflowError, SharedClock, Timestamp,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// One probe call is allowed through to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a call made through [`CircuitBreaker::call`].
///
/// The wrapped function's own error is always returned unchanged in
/// [`CallError::Inner`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),

    #[error("Call through circuit {name} exceeded {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error(transparent)]
    Inner(E),
}

impl<E> CallError<E> {
    /// True if the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    /// The wrapped function's error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Into<LeadflowError>> From<CallError<E>> for LeadflowError {
    fn from(err: CallError<E>) -> Self {
        match err {
            CallError::Open(open) => LeadflowError::CircuitOpen(open),
            CallError::Timeout { timeout, .. } => {
                LeadflowError::Execution(ExecutionError::Timeout { limit: timeout })
            }
            CallError::Inner(e) => e.into(),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<Timestamp>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Timestamp>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one named resource.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move Open to HalfOpen once the recovery timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerState, now: Timestamp) {
        if inner.state != CircuitState::Open {
            return;
        }
        let recovered = inner
            .last_failure_at
            .map_or(true, |at| elapsed_between(at, now) >= self.config.recovery_timeout);
        if recovered {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            tracing::info!(circuit = %self.name, "Circuit half-open, admitting probe");
        }
    }

    fn open_error(&self, inner: &BreakerState, now: Timestamp) -> CircuitOpenError {
        let opened_at = inner.last_failure_at.unwrap_or(now);
        CircuitOpenError {
            name: self.name.clone(),
            opened_at,
            retry_at: add_duration(opened_at, self.config.recovery_timeout),
        }
    }

    /// Current state, applying a pending Open to HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Reserve the right to make one call.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(self.open_error(&inner, now)),
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.probe_in_flight = false;
            tracing::info!(circuit = %self.name, "Circuit closed after successful probe");
        } else if inner.state == CircuitState::Closed && self.config.reset_on_success {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        inner.failure_count = inner.failure_count.saturating_add(1);

        if probe {
            inner.state = CircuitState::Open;
            inner.probe_in_flight = false;
            tracing::warn!(circuit = %self.name, "Probe failed, circuit reopened");
        } else if inner.state == CircuitState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            tracing::warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                "Circuit opened"
            );
        }
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`CallError::Open`] without calling `f` when the circuit is
    /// open. Any error from `f`, and a timeout when `call_timeout` is set,
    /// counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CallError::Open)?;

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(CallError::Inner),
                Err(_) => Err(CallError::Timeout {
                    name: self.name.clone(),
                    timeout: limit,
                }),
            },
            None => f().await.map_err(CallError::Inner),
        };

        match &outcome {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        outcome
    }

    /// Force the breaker closed and clear its failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Must be settled with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unsettled probe permit frees the
/// probe slot without recording an outcome.
#[must_use = "a permit must be settled with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// True if this call is the half-open recovery probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Named breakers owned by the optimizer, one per protected resource.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    clock: SharedClock,
}

impl BreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            clock,
        }
    }

    /// Create and register a breaker, replacing any with the same name.
    pub fn add(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone()));
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Fetch a breaker, creating it with the default config if absent.
    pub fn get_or_insert(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_clock(
                name,
                self.defaults.clone(),
                self.clock.clone(),
            ))
        }))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// State of every breaker by name.
    pub fn status(&self) -> BTreeMap<String, CircuitState> {
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.all().iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Degraded while any breaker is not closed.
    pub fn health(&self) -> HealthCheck {
        let tripped: Vec<String> = self
            .status()
            .into_iter()
            .filter(|(_, state)| *state != CircuitState::Closed)
            .map(|(name, _)| name)
            .collect();
        if tripped.is_empty() {
            HealthCheck::healthy("circuits")
        } else {
            HealthCheck::degraded("circuits", format!("not closed: {}", tripped.join(", ")))
                .with_metadata("tripped", serde_json::json!(tripped))
        }
    }
}
