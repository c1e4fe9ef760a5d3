//! In-process L2 store.
//!
//! Useful for sharing one store between several multi-level caches in the
//! same process, and as a stand-in for a remote store in tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::{add_duration, system_clock, CacheError, SharedClock, Timestamp};

use crate::traits::L2Store;

/// Hash map backed [`L2Store`] with lazy expiry.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Timestamp)>>,
    clock: SharedClock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Vec<u8>, Timestamp)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl L2Store for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some((_, expires_at)) if now >= *expires_at => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = add_duration(self.clock.now(), ttl);
        self.lock().insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::ManualClock;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new();
        store
            .set_ex("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .expect("set should succeed");
        assert_eq!(
            store.get("k").await.expect("get should succeed"),
            Some(b"v".to_vec())
        );
        assert!(store.delete("k").await.expect("delete should succeed"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_returned() {
        let clock = ManualClock::starting_now();
        let store = InMemoryStore::with_clock(clock.shared());
        store
            .set_ex("k", b"v".to_vec(), Duration::from_secs(5))
            .await
            .expect("set should succeed");

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").await.expect("get should succeed"), None);
        assert_eq!(store.len(), 0);
    }
}
