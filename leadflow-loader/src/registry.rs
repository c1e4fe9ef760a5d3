//! Named loader registry.
//!
//! Loaders of different key and value types live side by side behind
//! [`ErasedLoader`]; typed handles are recovered with [`LoaderRegistry::get`].
//! A [`RegistrationGuard`] removes its loader when dropped, so a loader
//! scoped to one unit of work cannot outlive it in the registry.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::batch_fn::{LoaderKey, LoaderValue};
use crate::loader::{BatchLoader, LoaderStats};

/// Type-erased view of a [`BatchLoader`].
pub trait ErasedLoader: Send + Sync {
    fn name(&self) -> &str;
    fn clear_request_cache(&self);
    fn stats(&self) -> LoaderStats;
    fn as_any(&self) -> &dyn Any;
}

impl<K: LoaderKey, V: LoaderValue> ErasedLoader for BatchLoader<K, V> {
    fn name(&self) -> &str {
        BatchLoader::name(self)
    }

    fn clear_request_cache(&self) {
        BatchLoader::clear_request_cache(self)
    }

    fn stats(&self) -> LoaderStats {
        BatchLoader::stats(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Registered {
    id: u64,
    loader: Arc<dyn ErasedLoader>,
}

/// Loaders by name.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: RwLock<HashMap<String, Registered>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("loaders", &self.names())
            .finish()
    }
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Registered>> {
        self.loaders.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Registered>> {
        self.loaders.write().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, loader: Arc<dyn ErasedLoader>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = loader.name().to_string();
        if self.write().insert(name.clone(), Registered { id, loader }).is_some() {
            tracing::debug!(loader = %name, "Replaced registered loader");
        }
        id
    }

    /// Register `loader` under its name, replacing any previous one.
    pub fn register<K: LoaderKey, V: LoaderValue>(&self, loader: BatchLoader<K, V>) {
        self.insert(Arc::new(loader));
    }

    /// Register `loader` until the returned guard is dropped.
    pub fn scoped<K: LoaderKey, V: LoaderValue>(
        self: &Arc<Self>,
        loader: BatchLoader<K, V>,
    ) -> RegistrationGuard {
        let name = loader.name().to_string();
        let id = self.insert(Arc::new(loader));
        RegistrationGuard {
            registry: Arc::clone(self),
            name,
            id,
        }
    }

    /// Typed handle to the loader named `name`.
    ///
    /// `None` if no loader has that name or its key/value types differ.
    pub fn get<K: LoaderKey, V: LoaderValue>(&self, name: &str) -> Option<BatchLoader<K, V>> {
        self.read()
            .get(name)
            .and_then(|r| r.loader.as_any().downcast_ref::<BatchLoader<K, V>>().cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    fn unregister_id(&self, name: &str, id: u64) {
        let mut loaders = self.write();
        if loaders.get(name).is_some_and(|r| r.id == id) {
            loaders.remove(name);
        }
    }

    /// Clear every loader's request-scoped cache.
    pub fn clear_request_caches(&self) {
        for registered in self.read().values() {
            registered.loader.clear_request_cache();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> BTreeMap<String, LoaderStats> {
        self.read()
            .iter()
            .map(|(name, r)| (name.clone(), r.loader.stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Unregisters its loader on drop.
///
/// A later registration under the same name is left alone.
#[must_use = "the loader is unregistered when the guard is dropped"]
pub struct RegistrationGuard {
    registry: Arc<LoaderRegistry>,
    name: String,
    id: u64,
}

impl RegistrationGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister_id(&self.name, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_fn::{batch_fn, BatchError};
    use leadflow_core::LoaderConfig;

    fn echo(name: &str) -> BatchLoader<u32, u32> {
        BatchLoader::new(
            name,
            batch_fn(|keys: Vec<u32>| async move { Ok::<_, BatchError>(keys) }),
            LoaderConfig::default(),
        )
        .expect("valid config")
    }

    #[test]
    fn test_typed_get() {
        let registry = LoaderRegistry::new();
        registry.register(echo("leads"));

        assert!(registry.get::<u32, u32>("leads").is_some());
        assert!(registry.get::<String, u32>("leads").is_none(), "wrong key type");
        assert!(registry.get::<u32, u32>("missing").is_none());
        assert_eq!(registry.names(), vec!["leads".to_string()]);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = Arc::new(LoaderRegistry::new());
        {
            let guard = registry.scoped(echo("request"));
            assert_eq!(guard.name(), "request");
            assert!(registry.contains("request"));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_guard_leaves_replacement_alone() {
        let registry = Arc::new(LoaderRegistry::new());
        let guard = registry.scoped(echo("request"));
        registry.register(echo("request"));
        drop(guard);
        assert!(registry.contains("request"));
    }

    #[tokio::test]
    async fn test_clear_request_caches_and_stats() {
        let registry = LoaderRegistry::new();
        let loader = echo("leads");
        registry.register(loader.clone());

        loader.load(1).await.expect("load succeeds");
        assert_eq!(registry.stats()["leads"].request_cache_size, 1);

        registry.clear_request_caches();
        assert_eq!(registry.stats()["leads"].request_cache_size, 0);
        assert!(registry.unregister("leads"));
        assert!(!registry.unregister("leads"));
    }
}
