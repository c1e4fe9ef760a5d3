//! Shared (L2) cache store trait.
//!
//! An L2 store is an optimization, never a correctness dependency: the
//! multi-level cache swallows and logs every error returned here.
//! Payloads are opaque bytes; stores enforce their own expiry.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::CacheError;

/// Key/value store used as the shared cache tier.
///
/// Implementations must be safe for concurrent use and must not return an
/// entry after its TTL has elapsed.
#[async_trait]
pub trait L2Store: Send + Sync + fmt::Debug {
    /// Short backend name used in logs and health reports.
    fn name(&self) -> &str;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Fetch the payload stored under `key`, if any and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`. Returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}
