//! LMDB-backed L2 store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key/value store that survives process restarts and can be shared by
//! processes on the same host.
//!
//! # Value Format
//!
//! `[expires_at millis: 8 bytes LE][payload]`. Expiry is checked lazily on
//! read; an expired entry is deleted by the read that finds it.
//! [`LmdbStore::purge_expired`] sweeps the whole database.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use leadflow_core::{add_duration, system_clock, CacheError, SharedClock, Timestamp};

use crate::traits::L2Store;

const HEADER_LEN: usize = 8;

fn backend_err(operation: &str, e: impl std::fmt::Display) -> CacheError {
    CacheError::Backend {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

fn encode(expires_at: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&expires_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn decode(bytes: &[u8]) -> Result<(Timestamp, &[u8]), CacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(CacheError::Serialization {
            reason: format!("entry of {} bytes is shorter than its header", bytes.len()),
        });
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let mut millis = [0u8; HEADER_LEN];
    millis.copy_from_slice(header);
    let expires_at = DateTime::from_timestamp_millis(i64::from_le_bytes(millis)).ok_or_else(
        || CacheError::Serialization {
            reason: "expiry header out of range".to_string(),
        },
    )?;
    Ok((expires_at, payload))
}

/// LMDB-backed [`L2Store`].
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::open("/var/cache/leadflow", 100)?;
/// let cache = MultiLevelCache::connect(&config, Some(Arc::new(store)), clock).await?;
/// ```
pub struct LmdbStore {
    env: Env,
    db: Database<Bytes, Bytes>,
    clock: SharedClock,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbStore {
    /// Open (creating if needed) an LMDB environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::BackendUnavailable`] if the directory cannot be
    /// created or the environment or database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, CacheError> {
        Self::open_with_clock(path, max_size_mb, system_clock())
    }

    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: SharedClock,
    ) -> Result<Self, CacheError> {
        let unavailable = |e: &dyn std::fmt::Display| CacheError::BackendUnavailable {
            reason: e.to_string(),
        };

        std::fs::create_dir_all(&path).map_err(|e| unavailable(&e))?;

        // SAFETY: the environment is opened once per store and the map is
        // never accessed outside heed's transaction API.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| unavailable(&e))?;

        let mut wtxn = env.write_txn().map_err(|e| unavailable(&e))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| unavailable(&e))?;
        wtxn.commit().map_err(|e| unavailable(&e))?;

        Ok(Self { env, db, clock })
    }

    fn remove(&self, key: &[u8]) -> Result<bool, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(|e| backend_err("delete", e))?;
        let deleted = self
            .db
            .delete(&mut wtxn, key)
            .map_err(|e| backend_err("delete", e))?;
        wtxn.commit().map_err(|e| backend_err("delete", e))?;
        Ok(deleted)
    }

    /// Delete every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(|e| backend_err("purge", e))?;
            let iter = self.db.iter(&rtxn).map_err(|e| backend_err("purge", e))?;
            let mut keys = Vec::new();
            for (key, value) in iter.flatten() {
                match decode(value) {
                    Ok((expires_at, _)) if now < expires_at => {}
                    // Undecodable entries can never be served; drop them too.
                    _ => keys.push(key.to_vec()),
                }
            }
            keys
        };

        let mut wtxn = self.env.write_txn().map_err(|e| backend_err("purge", e))?;
        let mut deleted = 0u64;
        for key in &expired {
            if self.db.delete(&mut wtxn, key).unwrap_or(false) {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(|e| backend_err("purge", e))?;
        Ok(deleted)
    }

    /// Number of stored entries, including expired ones not yet removed.
    pub fn len(&self) -> Result<u64, CacheError> {
        let rtxn = self.env.read_txn().map_err(|e| backend_err("len", e))?;
        self.db.len(&rtxn).map_err(|e| backend_err("len", e))
    }
}

#[async_trait]
impl L2Store for LmdbStore {
    fn name(&self) -> &str {
        "lmdb"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.env
            .read_txn()
            .map(drop)
            .map_err(|e| CacheError::BackendUnavailable {
                reason: e.to_string(),
            })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now();
        let found = {
            let rtxn = self.env.read_txn().map_err(|e| backend_err("get", e))?;
            match self
                .db
                .get(&rtxn, key.as_bytes())
                .map_err(|e| backend_err("get", e))?
            {
                Some(bytes) => {
                    let (expires_at, payload) = decode(bytes)?;
                    Some((expires_at, payload.to_vec()))
                }
                None => None,
            }
        };

        match found {
            Some((expires_at, _)) if now >= expires_at => {
                self.remove(key.as_bytes())?;
                Ok(None)
            }
            Some((_, payload)) => Ok(Some(payload)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let bytes = encode(add_duration(self.clock.now(), ttl), &value);

        let mut wtxn = self.env.write_txn().map_err(|e| backend_err("set", e))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(|e| backend_err("set", e))?;
        wtxn.commit().map_err(|e| backend_err("set", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.remove(key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, ManualClock, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = ManualClock::starting_now();
        let store = LmdbStore::open_with_clock(temp_dir.path(), 10, clock.shared())
            .expect("store creation should succeed");
        (store, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_ping() {
        let (store, _clock, _dir) = create_test_store();
        store.ping().await.expect("ping should succeed");
        assert_eq!(store.name(), "lmdb");
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _clock, _dir) = create_test_store();
        store
            .set_ex("graphql:query:abc", b"{\"a\":1}".to_vec(), Duration::from_secs(60))
            .await
            .expect("set should succeed");

        let value = store
            .get("graphql:query:abc")
            .await
            .expect("get should succeed");
        assert_eq!(value.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _clock, _dir) = create_test_store();
        assert!(store.get("nope").await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_deleted_on_read() {
        let (store, clock, _dir) = create_test_store();
        store
            .set_ex("k", b"v".to_vec(), Duration::from_secs(30))
            .await
            .expect("set should succeed");

        clock.advance(Duration::from_secs(31));
        assert!(store.get("k").await.expect("get should succeed").is_none());
        assert_eq!(store.len().expect("len should succeed"), 0);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let (store, _clock, _dir) = create_test_store();
        store
            .set_ex("k", b"one".to_vec(), Duration::from_secs(30))
            .await
            .expect("set should succeed");
        store
            .set_ex("k", b"two".to_vec(), Duration::from_secs(30))
            .await
            .expect("set should succeed");
        assert_eq!(
            store.get("k").await.expect("get should succeed"),
            Some(b"two".to_vec())
        );

        assert!(store.delete("k").await.expect("delete should succeed"));
        assert!(!store.delete("k").await.expect("delete should succeed"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock, _dir) = create_test_store();
        for i in 0..3 {
            store
                .set_ex(&format!("short:{i}"), vec![i], Duration::from_secs(1))
                .await
                .expect("set should succeed");
        }
        store
            .set_ex("long", vec![9], Duration::from_secs(600))
            .await
            .expect("set should succeed");

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().expect("purge should succeed"), 3);
        assert_eq!(store.len().expect("len should succeed"), 1);
    }

    #[test]
    fn test_decode_rejects_short_entry() {
        assert!(matches!(
            decode(&[1, 2, 3]),
            Err(CacheError::Serialization { .. })
        ));
    }
}
