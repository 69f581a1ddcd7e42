//! Token cache storage contract and the in-memory store.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::entry::CacheEntry;
use super::key::{CacheFilter, CacheKey};
use crate::error::CacheError;

/// Persistent key/value store of cached credentials.
///
/// Implementations must tolerate concurrent readers and concurrent writers.
/// Writes are last-writer-wins, but a write must never leave a partially
/// written entry behind. Serialization format is up to the store.
pub trait TokenCacheStore: Send + Sync {
    /// Get the entry stored under exactly this key.
    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace the entry for a key.
    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Remove one entry. Removing a missing key is not an error.
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Every entry whose key matches the filter.
    fn items_matching(&self, filter: &CacheFilter) -> Result<Vec<(CacheKey, CacheEntry)>, CacheError>;

    /// Remove every entry whose key matches the filter, returning how many were removed.
    fn remove_all_matching(&self, filter: &CacheFilter) -> Result<usize, CacheError>;
}

static SHARED_CACHE: Lazy<Arc<MemoryTokenCache>> = Lazy::new(|| Arc::new(MemoryTokenCache::new()));

/// In-process token cache.
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by contexts that do not supply their own store.
    pub fn shared() -> Arc<MemoryTokenCache> {
        Arc::clone(&SHARED_CACHE)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl TokenCacheStore for MemoryTokenCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries.write().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn items_matching(&self, filter: &CacheFilter) -> Result<Vec<(CacheKey, CacheEntry)>, CacheError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| filter.matches(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_all_matching(&self, filter: &CacheFilter) -> Result<usize, CacheError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !filter.matches(k));
        Ok(before - entries.len())
    }
}
