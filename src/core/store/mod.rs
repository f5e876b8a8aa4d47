//! Content-addressed manifest store
//!
//! Three tiers, read top-down and populated bottom-up:
//!
//! 1. [`MemoryTier`] - in-process LRU
//! 2. [`FsTier`] - local filesystem (optional)
//! 3. [`ManifestBackend`] - durable, authoritative
//!
//! A key is always the SHA-256 of its value. Writes of identical bytes are
//! no-ops, so concurrent writers converge without coordination. Every tier
//! read is re-hashed before it is trusted.

mod backend;
mod fs;
mod memory;

pub use backend::{ManifestBackend, MemoryBackend};
pub use fs::FsTier;
pub use memory::MemoryTier;

use crate::config::StoreConfig;
use crate::core::manifest::ContentHash;
use crate::core::telemetry::{CacheEvent, MetricsSink, NoopMetrics};
use crate::error::{ProvenanceError, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Bytes were written to the backend
    Stored,
    /// Identical bytes were already present; nothing was written
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutReceipt {
    pub hash: ContentHash,
    pub outcome: PutOutcome,
}

pub struct ManifestStore {
    memory: MemoryTier,
    fs: Option<FsTier>,
    backend: Arc<dyn ManifestBackend>,
    key_prefix: String,
    metrics: Arc<dyn MetricsSink>,
}

impl ManifestStore {
    pub fn new(config: &StoreConfig, backend: Arc<dyn ManifestBackend>) -> Self {
        ManifestStore {
            memory: MemoryTier::new(config.memory_capacity),
            fs: config.fs_root.as_ref().map(FsTier::new),
            backend,
            key_prefix: config.key_prefix.clone(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Store backed only by memory, for tests and tools
    pub fn in_memory() -> Self {
        Self::new(&StoreConfig::default(), Arc::new(MemoryBackend::new()))
    }

    pub fn backend_key(&self, hash: &ContentHash) -> String {
        format!("{}{}", self.key_prefix, hash)
    }

    pub fn memory_tier(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn fs_tier(&self) -> Option<&FsTier> {
        self.fs.as_ref()
    }

    /// Store `bytes` under their own hash
    ///
    /// Fails with [`ProvenanceError::StoreIntegrityViolation`] if the backend
    /// already holds different bytes under that key; the existing value is
    /// never overwritten.
    pub async fn put(&self, bytes: &[u8]) -> Result<PutReceipt> {
        let hash = ContentHash::of(bytes);
        let key = self.backend_key(&hash);

        let outcome = match self.backend.get(&key).await? {
            Some(existing) if existing == bytes => PutOutcome::AlreadyPresent,
            Some(_) => {
                error!("Integrity violation: backend key {} holds foreign bytes", key);
                return Err(ProvenanceError::StoreIntegrityViolation {
                    hash: hash.to_hex(),
                });
            }
            None => {
                self.backend.put(&key, bytes).await?;
                PutOutcome::Stored
            }
        };

        let shared: Arc<[u8]> = Arc::from(bytes);
        self.populate_fs(&hash, &shared).await;
        self.memory.insert(hash, shared);

        debug!("Put manifest {} ({:?}, {} bytes)", hash, outcome, bytes.len());
        Ok(PutReceipt { hash, outcome })
    }

    /// Fetch by hash, trying each tier in turn
    pub async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>> {
        if let Some(bytes) = self.memory.get(hash) {
            self.metrics.record(CacheEvent::MemoryHit);
            return Ok(Some(bytes));
        }

        if let Some(fs) = &self.fs {
            match fs.read(hash).await {
                Ok(Some(bytes)) if hash.matches(&bytes) => {
                    self.metrics.record(CacheEvent::FilesystemHit);
                    let shared: Arc<[u8]> = Arc::from(bytes);
                    self.memory.insert(*hash, shared.clone());
                    return Ok(Some(shared));
                }
                Ok(Some(_)) => {
                    warn!("Evicting corrupt filesystem entry for {}", hash);
                    if let Err(e) = fs.remove(hash).await {
                        warn!("Failed to remove corrupt entry {}: {}", hash, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Filesystem tier read failed for {}: {}", hash, e),
            }
        }

        let key = self.backend_key(hash);
        match self.backend.get(&key).await? {
            Some(bytes) if hash.matches(&bytes) => {
                self.metrics.record(CacheEvent::BackendHit);
                let shared: Arc<[u8]> = Arc::from(bytes);
                self.populate_fs(hash, &shared).await;
                self.memory.insert(*hash, shared.clone());
                Ok(Some(shared))
            }
            Some(_) => {
                error!("Integrity violation: backend key {} does not hash to its name", key);
                Err(ProvenanceError::StoreIntegrityViolation {
                    hash: hash.to_hex(),
                })
            }
            None => {
                self.metrics.record(CacheEvent::StoreMiss);
                Ok(None)
            }
        }
    }

    pub async fn contains(&self, hash: &ContentHash) -> Result<bool> {
        if self.memory.contains(hash) {
            return Ok(true);
        }
        Ok(self.backend.get(&self.backend_key(hash)).await?.is_some())
    }

    /// Hashes in the backend whose hex form starts with `hex_prefix`
    pub async fn list(&self, hex_prefix: &str) -> Result<Vec<ContentHash>> {
        let prefix = format!("{}{}", self.key_prefix, hex_prefix);
        let keys = self.backend.list(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&self.key_prefix))
            .filter_map(|hex| ContentHash::from_hex(hex).ok())
            .collect())
    }

    async fn populate_fs(&self, hash: &ContentHash, bytes: &[u8]) {
        if let Some(fs) = &self.fs {
            if let Err(e) = fs.write(hash, bytes).await {
                warn!("Filesystem tier write failed for {}: {}", hash, e);
            }
        }
    }
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("memory_entries", &self.memory.len())
            .field("fs", &self.fs)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry::AtomicMetrics;
    use tempfile::TempDir;

    fn tiered(dir: &TempDir) -> (ManifestStore, Arc<MemoryBackend>, Arc<AtomicMetrics>) {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let config = StoreConfig {
            fs_root: Some(dir.path().to_path_buf()),
            ..StoreConfig::default()
        };
        let store = ManifestStore::new(&config, backend.clone()).with_metrics(metrics.clone());
        (store, backend, metrics)
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = ManifestStore::in_memory();
        let first = store.put(b"manifest").await.unwrap();
        let second = store.put(b"manifest").await.unwrap();
        assert_eq!(first.outcome, PutOutcome::Stored);
        assert_eq!(second.outcome, PutOutcome::AlreadyPresent);
        assert_eq!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn test_foreign_bytes_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ManifestStore::new(&StoreConfig::default(), backend.clone());
        let hash = ContentHash::of(b"genuine");
        backend
            .put(&store.backend_key(&hash), b"forged")
            .await
            .unwrap();

        let err = store.put(b"genuine").await.unwrap_err();
        assert!(matches!(err, ProvenanceError::StoreIntegrityViolation { .. }));
        assert_eq!(
            backend.get(&store.backend_key(&hash)).await.unwrap(),
            Some(b"forged".to_vec())
        );
        assert!(store.get(&hash).await.is_err());
    }

    #[tokio::test]
    async fn test_tiers_populate_upward() {
        let dir = TempDir::new().unwrap();
        let (store, backend, metrics) = tiered(&dir);
        let hash = ContentHash::of(b"m");
        backend.put(&store.backend_key(&hash), b"m").await.unwrap();

        assert!(store.get(&hash).await.unwrap().is_some());
        assert!(store.get(&hash).await.unwrap().is_some());
        let snap = metrics.snapshot();
        assert_eq!(snap.backend_hits, 1);
        assert_eq!(snap.memory_hits, 1);
        assert!(store.fs_tier().unwrap().path_for(&hash).exists());
    }

    #[tokio::test]
    async fn test_corrupt_fs_entry_evicted() {
        let dir = TempDir::new().unwrap();
        let (store, _backend, metrics) = tiered(&dir);
        let receipt = store.put(b"real").await.unwrap();
        store.memory_tier().remove(&receipt.hash);

        let path = store.fs_tier().unwrap().path_for(&receipt.hash);
        std::fs::write(&path, b"rotten").unwrap();

        let bytes = store.get(&receipt.hash).await.unwrap().unwrap();
        assert_eq!(&*bytes, b"real");
        assert_eq!(metrics.snapshot().backend_hits, 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"real");
    }

    #[tokio::test]
    async fn test_miss_and_list() {
        let store = ManifestStore::in_memory();
        assert!(store.get(&ContentHash::of(b"absent")).await.unwrap().is_none());

        let a = store.put(b"a").await.unwrap().hash;
        let b = store.put(b"b").await.unwrap().hash;
        let mut all = store.list("").await.unwrap();
        all.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(all, expected);

        let hex = a.to_hex();
        assert!(store.list(&hex[..4]).await.unwrap().contains(&a));
        assert!(store.contains(&b).await.unwrap());
    }
}
