//! In-process tier: bounded LRU of manifest bytes

use crate::core::manifest::ContentHash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// LRU of manifest bytes keyed by hash
///
/// Values are shared, so a hit only bumps a reference count.
pub struct MemoryTier {
    cache: Mutex<LruCache<ContentHash, Arc<[u8]>>>,
}

impl MemoryTier {
    /// Create a tier holding at most `capacity` manifests (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        MemoryTier {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Arc<[u8]>> {
        self.cache.lock().get(hash).cloned()
    }

    pub fn insert(&self, hash: ContentHash, bytes: Arc<[u8]>) {
        self.cache.lock().put(hash, bytes);
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.cache.lock().contains(hash)
    }

    pub fn remove(&self, hash: &ContentHash) {
        self.cache.lock().pop(hash);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
