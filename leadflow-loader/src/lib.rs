//! LeadFlow Loader - request batching for N+1 prevention
//!
//! A [`BatchLoader`] collects single-key loads into calls to a
//! [`BatchFn`], deduplicates keys, and caches results in a request-scoped
//! map and an optional expiring persistent cache. An optional circuit
//! breaker guards the batch function.

pub mod batch_fn;
pub mod loader;
pub mod registry;

pub use batch_fn::{batch_fn, BatchError, BatchFn, FnBatch, LoaderKey, LoaderValue};
pub use loader::{BatchLoader, BatchLoaderBuilder, LoaderStats};
pub use registry::{ErasedLoader, LoaderRegistry, RegistrationGuard};
