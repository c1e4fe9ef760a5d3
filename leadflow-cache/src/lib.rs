//! LeadFlow Cache - local and multi-level caching
//!
//! - [`ExpiringLruCache`]: bounded in-process store with TTL and recency
//!   eviction, used standalone and as the L1 tier.
//! - [`L2Store`]: shared tier abstraction with [`LmdbStore`] and
//!   [`InMemoryStore`] implementations.
//! - [`MultiLevelCache`]: L1 in front of an optional L2, promoting on L2 hits
//!   and degrading to L1-only when L2 is unreachable at startup.

pub mod lmdb_store;
pub mod local;
pub mod memory_store;
pub mod multi_level;
pub mod traits;

pub use lmdb_store::LmdbStore;
pub use local::{CacheEntry, ExpiringLruCache, LocalCacheStats};
pub use memory_store::InMemoryStore;
pub use multi_level::{MultiLevelCache, MultiLevelStats};
pub use traits::L2Store;
