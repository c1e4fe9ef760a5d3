//! Batch function contract.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;

use async_trait::async_trait;

/// Error raised by a batch function for the whole batch.
pub type BatchError = Box<dyn std::error::Error + Send + Sync>;

/// Keys a loader can batch on.
///
/// `Display` is used to report the failed key set in errors.
pub trait LoaderKey: Eq + Hash + Clone + Send + Sync + fmt::Display + 'static {}

impl<T> LoaderKey for T where T: Eq + Hash + Clone + Send + Sync + fmt::Display + 'static {}

/// Values a loader can cache and hand out.
pub trait LoaderValue: Clone + Send + Sync + 'static {}

impl<T> LoaderValue for T where T: Clone + Send + Sync + 'static {}

/// Multi-key fetch behind a [`BatchLoader`](crate::BatchLoader).
///
/// Must return exactly one value per key, in key order. Per-key failures
/// belong inside `V` (for example `Option<Row>` or `Result<Row, String>`);
/// returning `Err` fails every key of the batch.
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync {
    async fn load(&self, keys: &[K]) -> Result<Vec<V>, BatchError>;
}

/// Adapter turning an async closure into a [`BatchFn`].
///
/// ```ignore
/// let users = batch_fn(|ids: Vec<u64>| async move { db.users_by_id(&ids).await });
/// ```
pub struct FnBatch<F, K, V> {
    f: F,
    _marker: PhantomData<fn(Vec<K>) -> V>,
}

/// Wrap `f` as a [`BatchFn`]. The closure receives an owned copy of the keys.
pub fn batch_fn<F, Fut, K, V>(f: F) -> FnBatch<F, K, V>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<V>, BatchError>> + Send,
{
    FnBatch {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, K, V> BatchFn<K, V> for FnBatch<F, K, V>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<V>, BatchError>> + Send,
    K: Clone + Send + Sync,
    V: Send,
{
    async fn load(&self, keys: &[K]) -> Result<Vec<V>, BatchError> {
        (self.f)(keys.to_vec()).await
    }
}
