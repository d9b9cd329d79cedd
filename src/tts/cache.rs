//! Content-addressed store for synthesized audio.
//!
//! Keys come from [`cache_key`](super::cache_key), so equal normalized text
//! always lands on the same entry. Entries are written atomically (temp file
//! + fsync + rename): a reader sees either no entry or a complete one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::{Result, VoiceError};

/// Key to blob storage for synthesized audio.
///
/// Every failure is reported as [`VoiceError::CacheIo`]; the player treats
/// those as a miss and falls back to live synthesis.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Whether an entry exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read the entry for `key`.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Store `blob` under `key`, replacing any existing entry.
    async fn write(&self, key: &str, blob: &Bytes) -> Result<()>;
}

/// Cache entries as files under one directory: `{dir}/{key}.audio`.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    /// Open a store in `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::CacheIo`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            VoiceError::CacheIo(format!(
                "failed to create cache directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VoiceError::CacheIo(format!("invalid cache key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.audio")))
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entry_path(key)?.is_file())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.entry_path(key)?;
        let data = std::fs::read(&path).map_err(|e| {
            VoiceError::CacheIo(format!("failed to read {}: {e}", path.display()))
        })?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, key: &str, blob: &Bytes) -> Result<()> {
        let path = self.entry_path(key)?;
        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        std::fs::write(&tmp_path, blob).map_err(|e| {
            VoiceError::CacheIo(format!("failed to write {}: {e}", tmp_path.display()))
        })?;

        if let Ok(file) = std::fs::File::open(&tmp_path) {
            let _ = file.sync_all();
        }

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            VoiceError::CacheIo(format!("failed to commit {}: {e}", path.display()))
        })
    }
}

/// In-memory cache for tests and ephemeral sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryCacheStore {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| VoiceError::CacheIo(format!("no cache entry for {key}")))
    }

    async fn write(&self, key: &str, blob: &Bytes) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), blob.clone());
        Ok(())
    }
}
