//! Sliding-window rate limiter with a temporary block list.
//!
//! Each (identifier, endpoint class) pair keeps the timestamps of its
//! admitted requests inside the current window. Timestamps older than the
//! window are pruned lazily on the next check, so memory stays bounded by
//! one window's worth of requests per active identifier.
//!
//! Exceeding the quota blocks the pair for the class's block duration. When
//! a block expires the recorded timestamps are discarded, so the next
//! request starts a fresh window.

use std::collections::VecDeque;

use dashmap::DashMap;
use leadflow_core::{
    add_duration, system_clock, EndpointClass, EndpointLimit, RateLimitConfig, RateLimitExceeded,
    SharedClock, Timestamp,
};
use serde::Serialize;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the window; `None` when the check was bypassed.
    pub remaining: Option<u32>,
    /// When the caller may expect capacity again; `None` when bypassed.
    pub reset_at: Option<Timestamp>,
    pub blocked: bool,
}

impl RateLimitDecision {
    fn bypass() -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_at: None,
            blocked: false,
        }
    }

    fn blocked(until: Timestamp) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            reset_at: Some(until),
            blocked: true,
        }
    }
}

/// Limiter counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub tracked: usize,
    pub blocked: usize,
    pub allow_listed: usize,
}

#[derive(Debug, Default)]
struct WindowRecord {
    timestamps: VecDeque<Timestamp>,
    blocked_until: Option<Timestamp>,
}

impl WindowRecord {
    fn prune(&mut self, now: Timestamp, limit: &EndpointLimit) {
        while let Some(&oldest) = self.timestamps.front() {
            if add_duration(oldest, limit.window) <= now {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_blocked(&self, now: Timestamp) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

type RecordKey = (String, EndpointClass);

/// Per-identifier, per-endpoint-class sliding-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Window records keyed by identifier and endpoint class.
    records: DashMap<RecordKey, WindowRecord>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            records: DashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bypasses(&self, identifier: &str) -> bool {
        !self.config.enabled || self.config.allow_list.contains(identifier)
    }

    /// Check `identifier` against its class quota and record the request if
    /// admitted.
    pub fn check_and_record(&self, identifier: &str, class: &EndpointClass) -> RateLimitDecision {
        if self.bypasses(identifier) {
            return RateLimitDecision::bypass();
        }

        let limit = self.config.limit_for(class);
        let now = self.clock.now();
        // Entry guard is held for the whole check-and-record.
        let mut record = self
            .records
            .entry((identifier.to_string(), class.clone()))
            .or_default();

        if let Some(until) = record.blocked_until {
            if now < until {
                return RateLimitDecision::blocked(until);
            }
            record.blocked_until = None;
            record.timestamps.clear();
        }

        record.prune(now, &limit);

        let count = record.timestamps.len() as u32;
        if count >= limit.max_requests {
            let until = add_duration(now, limit.block_duration);
            record.blocked_until = Some(until);
            tracing::info!(
                identifier,
                endpoint = %class,
                max_requests = limit.max_requests,
                blocked_until = %until,
                "Rate limit exceeded, identifier blocked"
            );
            return RateLimitDecision::blocked(until);
        }

        record.timestamps.push_back(now);
        RateLimitDecision {
            allowed: true,
            remaining: Some(limit.max_requests - count - 1),
            reset_at: Some(add_duration(now, limit.window)),
            blocked: false,
        }
    }

    /// Like [`check_and_record`](Self::check_and_record) but returns an
    /// error when the request is not allowed.
    pub fn enforce(
        &self,
        identifier: &str,
        class: &EndpointClass,
    ) -> Result<RateLimitDecision, RateLimitExceeded> {
        let decision = self.check_and_record(identifier, class);
        if decision.allowed {
            return Ok(decision);
        }
        let limit = self.config.limit_for(class);
        Err(RateLimitExceeded {
            identifier: identifier.to_string(),
            endpoint: class.to_string(),
            max_requests: limit.max_requests,
            window: limit.window,
            reset_at: decision.reset_at.unwrap_or_else(|| self.clock.now()),
            blocked: decision.blocked,
        })
    }

    /// True if `identifier` is currently blocked on `class`.
    pub fn is_blocked(&self, identifier: &str, class: &EndpointClass) -> bool {
        let now = self.clock.now();
        self.records
            .get(&(identifier.to_string(), class.clone()))
            .is_some_and(|record| record.is_blocked(now))
    }

    /// Forget all history and blocks of `identifier` on every class.
    pub fn reset(&self, identifier: &str) {
        self.records.retain(|(id, _), _| id != identifier);
    }

    /// Drop records with no live block and no request inside their window.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.records.retain(|(_, class), record| {
            let limit = self.config.limit_for(class);
            record.prune(now, &limit);
            let keep = record.is_blocked(now) || !record.timestamps.is_empty();
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        RateLimiterStats {
            enabled: self.config.enabled,
            tracked: self.records.len(),
            blocked: self
                .records
                .iter()
                .filter(|entry| entry.value().is_blocked(now))
                .count(),
            allow_listed: self.config.allow_list.len(),
        }
    }
}
