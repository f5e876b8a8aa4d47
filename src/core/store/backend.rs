//! Durable backend boundary
//!
//! Any object store that can put, get and list by string key. Replication and
//! durability are the backend's concern.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[async_trait]
pub trait ManifestBackend: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous value
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Keys beginning with `prefix`, in lexicographic order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory backend for tests and single-process deployments
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ManifestBackend for MemoryBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.put("manifests/aa", b"1").await.unwrap();
        backend.put("manifests/ab", b"2").await.unwrap();
        backend.put("other/zz", b"3").await.unwrap();

        assert_eq!(backend.get("manifests/aa").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("missing").await.unwrap(), None);
        assert_eq!(
            backend.list("manifests/").await.unwrap(),
            vec!["manifests/aa".to_string(), "manifests/ab".to_string()]
        );
        assert_eq!(backend.len(), 3);
    }
}
