//! LeadFlow Core - shared types for the query optimizer
//!
//! Error taxonomy, configuration, clock and health types used by every
//! other crate in the workspace. No I/O happens here.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod health;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{
    add_duration, elapsed_between, system_clock, to_chrono, Clock, ManualClock, SharedClock,
    SystemClock,
};
pub use config::{
    CacheConfig, CircuitBreakerConfig, EndpointClass, EndpointLimit, EvictionPolicy,
    LoaderConfig, MonitoringConfig, OptimizerConfig, QueryConfig, RateLimitConfig,
};
pub use error::{
    AdmissionRejected, CacheError, CircuitOpenError, ConfigError, ErrorKind, ExecutionError,
    LeadflowError, LeadflowResult, LoaderError, RateLimitExceeded,
};
pub use health::{overall_status, HealthCheck, HealthStatus};
