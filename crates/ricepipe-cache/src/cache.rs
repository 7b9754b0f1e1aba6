//! Disk-backed result cache

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::{CacheError, CacheKey, Result};

/// Entries older than this are treated as misses unless configured otherwise
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(24 * 60 * 60);

const EXTENSION: &str = "cache";

/// Stored form of a cached value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub created_at: DateTime<Utc>,
    pub value: T,
}

impl<T> CacheEntry<T> {
    pub fn new(key: CacheKey, value: T) -> Self {
        Self {
            key,
            created_at: Utc::now(),
            value,
        }
    }

    /// Whether the entry is older than `staleness`
    pub fn is_stale(&self, staleness: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        match age.to_std() {
            Ok(age) => age > staleness,
            // Created in the future: clock moved backwards
            Err(_) => false,
        }
    }
}

/// Memoizes serializable results on disk
#[derive(Debug, Clone)]
pub struct ResultCache {
    base_path: PathBuf,
    staleness: Duration,
}

impl ResultCache {
    /// Create a cache rooted at `base_path`; the directory is created on first write
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            staleness: DEFAULT_STALENESS,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.base_path.join(format!("{}.{}", key.digest(), EXTENSION))
    }

    /// Fresh cached value for `key`, if any
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let path = self.entry_path(key);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, path = %path.display(), error = %err, "Removing corrupt cache entry");
                remove_if_present(&path).await?;
                return Ok(None);
            }
        };

        if entry.key != *key {
            warn!(key = %key, stored = %entry.key, "Cache digest collision, ignoring entry");
            return Ok(None);
        }
        if entry.is_stale(self.staleness) {
            debug!(key = %key, created_at = %entry.created_at, "Cache entry is stale");
            return Ok(None);
        }

        debug!(key = %key, "Cache hit");
        Ok(Some(entry.value))
    }

    /// Store `value` under `key`, replacing any previous entry
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;

        let entry = CacheEntry::new(key.clone(), value);
        let json = serde_json::to_string_pretty(&entry).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;

        // Write then rename so readers never observe a half-written entry
        let path = self.entry_path(key);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key = %key, path = %path.display(), "Cache entry stored");
        Ok(())
    }

    /// Cached value for `key`, or the result of `compute` (stored on success)
    ///
    /// Failures of `compute` are returned unchanged and nothing is stored.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        debug!(key = %key, "Cache miss, computing");
        let value = compute().await?;
        self.set(key, &value).await?;
        Ok(value)
    }

    /// Remove the entry for `key`; returns whether one existed
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        remove_if_present(&self.entry_path(key)).await
    }

    /// Remove every entry; returns how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == EXTENSION) && remove_if_present(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::from(name)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path().join("nested"));

        assert_eq!(cache.get::<Vec<String>>(&key("a")).await.unwrap(), None);

        let lines = vec!["b".to_string(), "bc".to_string()];
        cache.set(&key("a"), &lines).await.unwrap();
        assert_eq!(cache.get(&key("a")).await.unwrap(), Some(lines));
    }

    #[tokio::test]
    async fn test_stale_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path()).with_staleness(Duration::ZERO);

        cache.set(&key("a"), &1u32).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get::<u32>(&key("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path());
        let k = key("broken");
        let path = temp_dir.path().join(format!("{}.cache", k.digest()));
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(cache.get::<u32>(&k).await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path());
        let mut calls = 0;

        for _ in 0..3 {
            let value: std::result::Result<String, CacheError> = cache
                .get_or_compute(&key("expensive"), || {
                    calls += 1;
                    async { Ok("computed".to_string()) }
                })
                .await;
            assert_eq!(value.unwrap(), "computed");
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_failed_compute_is_not_stored() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path());

        let failed: std::result::Result<u32, CacheError> = cache
            .get_or_compute(&key("k"), || async {
                Err(CacheError::Serialization {
                    message: "boom".to_string(),
                })
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get::<u32>(&key("k")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path());

        cache.set(&key("a"), &1u32).await.unwrap();
        cache.set(&key("b"), &2u32).await.unwrap();
        std::fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        assert!(cache.invalidate(&key("a")).await.unwrap());
        assert!(!cache.invalidate(&key("a")).await.unwrap());
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.get::<u32>(&key("b")).await.unwrap(), None);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn test_clear_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::new(temp_dir.path().join("never-created"));
        assert_eq!(cache.clear().await.unwrap(), 0);
    }
}
