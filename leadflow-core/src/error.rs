//! Error types for LeadFlow query optimization

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unsupported eviction policy: {policy}")]
    UnsupportedEvictionPolicy { policy: String },
}

/// A query failed the depth/complexity admission gate.
///
/// Not retryable: the same query text will be rejected again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Query rejected: {reason}")]
pub struct AdmissionRejected {
    pub depth: u32,
    pub complexity: u32,
    pub max_depth: u32,
    pub max_complexity: u32,
    pub reason: String,
}

/// A circuit breaker rejected the call without attempting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit {name} is open, retry after {retry_at}")]
pub struct CircuitOpenError {
    pub name: String,
    pub opened_at: Timestamp,
    pub retry_at: Timestamp,
}

/// The rate limiter rejected a request.
///
/// Callers must not retry before `reset_at`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Rate limit exceeded for {identifier} on {endpoint}: {max_requests} requests per {window:?}, retry at {reset_at}"
)]
pub struct RateLimitExceeded {
    pub identifier: String,
    pub endpoint: String,
    pub max_requests: u32,
    pub window: Duration,
    pub reset_at: Timestamp,
    pub blocked: bool,
}

/// Batching loader errors.
///
/// These are `Clone` because one batch outcome is delivered to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Batch function for loader {loader} failed for {} keys: {reason}", .keys.len())]
    BatchExecution {
        loader: String,
        keys: Vec<String>,
        reason: String,
    },

    #[error("Batch function for loader {loader} returned {got} results for {expected} keys")]
    BatchShape {
        loader: String,
        keys: Vec<String>,
        expected: usize,
        got: usize,
    },

    #[error("Loader {loader} rejected {} keys: {source}", .keys.len())]
    CircuitOpen {
        loader: String,
        keys: Vec<String>,
        source: CircuitOpenError,
    },

    #[error("Batch for loader {loader} was dropped before it resolved")]
    Dropped { loader: String },
}

/// L2 cache backend errors. Never surfaced to query callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Cache backend {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Cache serialization error: {reason}")]
    Serialization { reason: String },
}

/// Errors raised by the caller-supplied execute function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Query execution failed: {message}")]
    Failed { message: String },

    #[error("Query execution exceeded {limit:?}")]
    Timeout { limit: Duration },
}

impl ExecutionError {
    /// Shorthand for a domain failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Master error type for all LeadFlow optimizer errors.
#[derive(Debug, Clone, Error)]
pub enum LeadflowError {
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionRejected),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Circuit error: {0}")]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Rate limit error: {0}")]
    RateLimited(#[from] RateLimitExceeded),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Result type alias for LeadFlow operations.
pub type LeadflowResult<T> = Result<T, LeadflowError>;

// ============================================================================
// ERROR KIND
// ============================================================================

/// High-level error categorization for metrics and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AdmissionRejected,
    BatchExecution,
    BatchShape,
    CircuitOpen,
    RateLimited,
    CacheUnavailable,
    Config,
    Execution,
    Timeout,
}

impl ErrorKind {
    /// Check if the failed operation may succeed when attempted again later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::BatchExecution
                | ErrorKind::CircuitOpen
                | ErrorKind::RateLimited
                | ErrorKind::Timeout
        )
    }
}

impl LeadflowError {
    /// Categorize this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeadflowError::Admission(_) => ErrorKind::AdmissionRejected,
            LeadflowError::Loader(LoaderError::BatchShape { .. }) => ErrorKind::BatchShape,
            LeadflowError::Loader(LoaderError::CircuitOpen { .. }) => ErrorKind::CircuitOpen,
            LeadflowError::Loader(_) => ErrorKind::BatchExecution,
            LeadflowError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            LeadflowError::RateLimited(_) => ErrorKind::RateLimited,
            LeadflowError::Cache(_) => ErrorKind::CacheUnavailable,
            LeadflowError::Config(_) => ErrorKind::Config,
            LeadflowError::Execution(ExecutionError::Timeout { .. }) => ErrorKind::Timeout,
            LeadflowError::Execution(_) => ErrorKind::Execution,
        }
    }

    /// Check if the caller may retry later.
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

// =============================================================================
// TESTS
// =============================================================================
