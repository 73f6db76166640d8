//! Cache store implementations.

use crate::index::CacheIndex;
use crate::retention::RetentionPolicy;
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::cache::{CacheEntry, CacheEvictionReason, CacheHit, SUFFIX_SEPARATOR};
use kiln_core::ports::CacheStore;
use kiln_core::{CacheEntryId, Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;
use tracing::{debug, info, warn};

fn new_entry(key: &str, suffix: &str, payload: &[u8]) -> Result<CacheEntry> {
    if key.is_empty() {
        return Err(Error::Cache("cache key must not be empty".to_string()));
    }
    if key.contains(SUFFIX_SEPARATOR) {
        return Err(Error::Cache(format!(
            "key '{key}' must not contain '{SUFFIX_SEPARATOR}'"
        )));
    }
    if suffix.contains(SUFFIX_SEPARATOR) {
        return Err(Error::Cache(format!(
            "suffix '{suffix}' must not contain '{SUFFIX_SEPARATOR}'"
        )));
    }
    let now = Utc::now();
    Ok(CacheEntry {
        id: CacheEntryId::new(),
        key: key.to_string(),
        suffix: suffix.to_string(),
        size_bytes: payload.len() as u64,
        checksum_sha256: hex::encode(Sha256::digest(payload)),
        created_at: now,
        last_accessed_at: now,
        access_count: 0,
    })
}

fn log_evictions(evicted: &[(CacheEntry, CacheEvictionReason)]) {
    for (entry, reason) in evicted {
        info!(
            key = %entry.key,
            suffix = %entry.suffix,
            size_bytes = entry.size_bytes,
            reason = ?reason,
            "Evicted cache entry"
        );
    }
}

#[derive(Default)]
struct MemoryState {
    index: CacheIndex,
    blobs: HashMap<CacheEntryId, Vec<u8>>,
}

impl MemoryState {
    fn hit(&mut self, id: CacheEntryId, exact: bool) -> Option<CacheHit> {
        let payload = self.blobs.get(&id)?.clone();
        let entry = self.index.touch(&id, Utc::now())?;
        Some(CacheHit {
            entry,
            payload,
            exact,
        })
    }
}

/// In-process cache store.
pub struct MemoryCacheStore {
    state: RwLock<MemoryState>,
    policy: RetentionPolicy,
}

impl MemoryCacheStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            policy,
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let mut state = self.state.write().await;
        let Some(id) = state.index.latest_exact(key).map(|e| e.id) else {
            return Ok(None);
        };
        Ok(state.hit(id, true))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Option<CacheHit>> {
        let mut state = self.state.write().await;
        let Some((id, exact)) = state
            .index
            .latest_with_prefix(prefix)
            .map(|e| (e.id, e.key == prefix))
        else {
            return Ok(None);
        };
        Ok(state.hit(id, exact))
    }

    async fn put(&self, key: &str, suffix: &str, payload: Vec<u8>) -> Result<CacheEntry> {
        let entry = new_entry(key, suffix, &payload)?;
        let mut state = self.state.write().await;
        state.blobs.insert(entry.id, payload);
        state.index.insert(entry.clone());
        let evicted = state.index.evict(&self.policy, Utc::now());
        for (old, _) in &evicted {
            state.blobs.remove(&old.id);
        }
        log_evictions(&evicted);
        debug!(key = %entry.key, size_bytes = entry.size_bytes, "Cache entry stored");
        Ok(entry)
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>> {
        Ok(self.state.read().await.index.list(prefix))
    }

    async fn delete(&self, entry: &CacheEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state.index.remove(&entry.id);
        state.blobs.remove(&entry.id);
        Ok(())
    }

    async fn prune(&self) -> Result<Vec<CacheEntry>> {
        let mut state = self.state.write().await;
        let evicted = state.index.evict(&self.policy, Utc::now());
        for (old, _) in &evicted {
            state.blobs.remove(&old.id);
        }
        log_evictions(&evicted);
        Ok(evicted.into_iter().map(|(entry, _)| entry).collect())
    }
}

/// Filesystem-based cache store.
///
/// Layout: one `<root>/entries/<entry id>.json` record and one
/// `<root>/blobs/<entry id>.bin` payload per save. Records are only ever
/// created, replaced whole or removed, and the index is rebuilt from them
/// before every operation, so stores in separate processes sharing a root
/// see each other's saves.
pub struct FilesystemCacheStore {
    root_dir: PathBuf,
    index: Mutex<CacheIndex>,
    policy: RetentionPolicy,
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Cache(format!("{context} {}: {e}", path.display()))
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl FilesystemCacheStore {
    /// Open (or create) a store rooted at `root_dir`.
    pub async fn open(root_dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Result<Self> {
        let root_dir = root_dir.into();
        for dir in [root_dir.join("blobs"), root_dir.join("entries")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("Failed to create cache dir", &dir, e))?;
        }

        let store = Self {
            root_dir,
            index: Mutex::new(CacheIndex::new()),
            policy,
        };
        let index = store.load_index().await?;
        debug!(root = %store.root_dir.display(), entries = index.len(), "Opened filesystem cache store");
        *store.index.lock().await = index;
        Ok(store)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn blob_path(&self, id: &CacheEntryId) -> PathBuf {
        self.root_dir.join("blobs").join(format!("{id}.bin"))
    }

    fn record_path(&self, id: &CacheEntryId) -> PathBuf {
        self.root_dir.join("entries").join(format!("{id}.json"))
    }

    /// Rebuild the index from the entry records currently on disk.
    async fn load_index(&self) -> Result<CacheIndex> {
        let dir = self.root_dir.join("entries");
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("Failed to read cache records", &dir, e))?;

        let mut index = CacheIndex::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| io_error("Failed to read cache records", &dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Evicted by another store since the directory was listed.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("Failed to read cache record", &path, e)),
            };
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => index.insert(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt cache record"),
            }
        }
        Ok(index)
    }

    /// Lock the in-process index and refresh it from disk.
    async fn refresh(&self) -> Result<MutexGuard<'_, CacheIndex>> {
        let mut index = self.index.lock().await;
        *index = self.load_index().await?;
        Ok(index)
    }

    /// Write one record through a uniquely named temp file so readers never
    /// see a torn record and concurrent writers never share a temp path.
    async fn write_record(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.record_path(&entry.id);
        let tmp = self
            .root_dir
            .join("entries")
            .join(format!("{}.{}.tmp", entry.id, Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error("Failed to write cache record", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("Failed to replace cache record", &path, e))
    }

    /// Remove the record first so no store can find an entry whose blob is going away.
    async fn remove_entry(&self, id: &CacheEntryId) {
        for path in [self.record_path(id), self.blob_path(id)] {
            if let Err(e) = ignore_missing(tokio::fs::remove_file(&path).await) {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }

    async fn remove_evicted(&self, evicted: &[(CacheEntry, CacheEvictionReason)]) {
        for (entry, _) in evicted {
            self.remove_entry(&entry.id).await;
        }
        log_evictions(evicted);
    }

    async fn read_hit(&self, index: &mut CacheIndex, id: CacheEntryId, exact: bool) -> Result<Option<CacheHit>> {
        let path = self.blob_path(&id);
        let payload = match tokio::fs::read(&path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Cache blob missing, dropping entry");
                index.remove(&id);
                self.remove_entry(&id).await;
                return Ok(None);
            }
            Err(e) => return Err(io_error("Failed to read cache blob", &path, e)),
        };
        let Some(entry) = index.touch(&id, Utc::now()) else {
            return Ok(None);
        };
        // Access statistics only feed LRU eviction; a lost update is harmless.
        if let Err(e) = self.write_record(&entry).await {
            warn!(key = %entry.key, error = %e, "Failed to record cache access");
        }
        Ok(Some(CacheHit {
            entry,
            payload,
            exact,
        }))
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let mut index = self.refresh().await?;
        let Some(id) = index.latest_exact(key).map(|e| e.id) else {
            return Ok(None);
        };
        self.read_hit(&mut index, id, true).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Option<CacheHit>> {
        let mut index = self.refresh().await?;
        let Some((id, exact)) = index
            .latest_with_prefix(prefix)
            .map(|e| (e.id, e.key == prefix))
        else {
            return Ok(None);
        };
        self.read_hit(&mut index, id, exact).await
    }

    async fn put(&self, key: &str, suffix: &str, payload: Vec<u8>) -> Result<CacheEntry> {
        let entry = new_entry(key, suffix, &payload)?;
        let path = self.blob_path(&entry.id);
        tokio::fs::write(&path, &payload)
            .await
            .map_err(|e| io_error("Failed to write cache blob", &path, e))?;
        if let Err(e) = self.write_record(&entry).await {
            self.remove_entry(&entry.id).await;
            return Err(e);
        }

        let mut index = self.refresh().await?;
        let evicted = index.evict(&self.policy, Utc::now());
        drop(index);

        self.remove_evicted(&evicted).await;
        info!(
            key = %entry.key,
            suffix = %entry.suffix,
            size_bytes = entry.size_bytes,
            "Cache entry saved"
        );
        Ok(entry)
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>> {
        Ok(self.refresh().await?.list(prefix))
    }

    async fn delete(&self, entry: &CacheEntry) -> Result<()> {
        let mut index = self.refresh().await?;
        if let Some(removed) = index.remove(&entry.id) {
            drop(index);
            self.remove_evicted(&[(removed, CacheEvictionReason::Manual)]).await;
        }
        Ok(())
    }

    async fn prune(&self) -> Result<Vec<CacheEntry>> {
        let mut index = self.refresh().await?;
        let evicted = index.evict(&self.policy, Utc::now());
        drop(index);
        self.remove_evicted(&evicted).await;
        Ok(evicted.into_iter().map(|(entry, _)| entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get_roundtrip() {
        let store = MemoryCacheStore::default();
        store.put("deps-abc", "1-a", b"payload".to_vec()).await.unwrap();

        let hit = store.get("deps-abc").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"payload");
        assert!(hit.exact);
        assert_eq!(hit.entry.access_count, 1);
        assert!(store.get("deps-ab").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_saves_never_overwrite() {
        let store = MemoryCacheStore::new(RetentionPolicy::unbounded());
        store.put("deps", "1-a", b"first".to_vec()).await.unwrap();
        store.put("deps", "2-b", b"second".to_vec()).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let hit = store.get("deps").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"second");
    }

    #[tokio::test]
    async fn test_memory_prefix_returns_latest_match() {
        let store = MemoryCacheStore::default();
        store.put("v1-x86_64-aaa", "1-a", b"old".to_vec()).await.unwrap();
        store.put("v1-x86_64-bbb", "2-b", b"new".to_vec()).await.unwrap();
        store.put("v1-aarch64-ccc", "3-c", b"arm".to_vec()).await.unwrap();

        let hit = store.get_prefix("v1-x86_64-").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"new");
        assert!(!hit.exact);
    }

    #[tokio::test]
    async fn test_rejects_separator_in_suffix() {
        let store = MemoryCacheStore::default();
        let err = store.put("deps", "a#b", vec![]).await.unwrap_err();
        assert!(err.is_cache());
    }

    #[tokio::test]
    async fn test_rejects_separator_in_key() {
        let store = MemoryCacheStore::default();
        let err = store.put("deps#1", "1-a", vec![]).await.unwrap_err();
        assert!(err.is_cache());
    }

    #[tokio::test]
    async fn test_filesystem_stores_sharing_a_root_keep_both_saves() {
        let dir = tempfile::tempdir().unwrap();
        let a = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();
        let b = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();

        a.put("v1-deps-aaa", "1-a", b"from a".to_vec()).await.unwrap();
        b.put("v1-deps-bbb", "2-b", b"from b".to_vec()).await.unwrap();

        assert_eq!(a.list(None).await.unwrap().len(), 2);
        assert_eq!(b.get("v1-deps-aaa").await.unwrap().unwrap().payload, b"from a");

        let reopened = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();
        let keys: Vec<String> = reopened
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["v1-deps-aaa".to_string(), "v1-deps-bbb".to_string()]);
        assert_eq!(reopened.get("v1-deps-aaa").await.unwrap().unwrap().payload, b"from a");
    }

    #[tokio::test]
    async fn test_filesystem_eviction_applies_to_other_handles_saves() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy {
            max_entries_per_key: 1,
            ..RetentionPolicy::default()
        };
        let a = FilesystemCacheStore::open(dir.path(), policy.clone()).await.unwrap();
        let b = FilesystemCacheStore::open(dir.path(), policy).await.unwrap();

        let first = a.put("deps", "1-a", b"one".to_vec()).await.unwrap();
        b.put("deps", "2-b", b"two".to_vec()).await.unwrap();

        assert!(!a.blob_path(&first.id).exists());
        assert!(!a.record_path(&first.id).exists());
        assert_eq!(a.get("deps").await.unwrap().unwrap().payload, b"two");
    }

    #[tokio::test]
    async fn test_filesystem_store_persists_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
                .await
                .unwrap();
            store.put("v1-deps-aaa", "1-a", b"tarball".to_vec()).await.unwrap();
        }

        let reopened = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();
        let hit = reopened.get_prefix("v1-deps-").await.unwrap().unwrap();
        assert_eq!(hit.payload, b"tarball");
        assert_eq!(hit.entry.key, "v1-deps-aaa");
    }

    #[tokio::test]
    async fn test_filesystem_store_evicts_surplus_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy {
            max_entries_per_key: 1,
            ..RetentionPolicy::default()
        };
        let store = FilesystemCacheStore::open(dir.path(), policy).await.unwrap();
        let first = store.put("deps", "1-a", b"one".to_vec()).await.unwrap();
        store.put("deps", "2-b", b"two".to_vec()).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 1);
        assert!(!store.blob_path(&first.id).exists());
    }

    #[tokio::test]
    async fn test_filesystem_missing_blob_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCacheStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();
        let entry = store.put("deps", "1-a", b"x".to_vec()).await.unwrap();
        std::fs::remove_file(store.blob_path(&entry.id)).unwrap();

        assert!(store.get("deps").await.unwrap().is_none());
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(!store.record_path(&entry.id).exists());
    }
}
