//! LeadFlow Guard - protection for the query pipeline
//!
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: reject-fast wrappers around
//!   failing backends with single-probe recovery.
//! - [`RateLimiter`]: sliding-window admission per caller and endpoint class.
//! - [`QueryComplexityAnalyzer`]: lexical depth/complexity gate.

pub mod admission;
pub mod circuit_breaker;
pub mod rate_limit;

pub use admission::{operation_name, ComplexityLevel, QueryAnalysis, QueryComplexityAnalyzer};
pub use circuit_breaker::{
    BreakerRegistry, CallError, CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState,
};
pub use rate_limit::{RateLimitDecision, RateLimiter, RateLimiterStats};
