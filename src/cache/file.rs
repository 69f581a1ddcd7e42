//! Token cache persisted as a local JSON document.

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::{CacheFilter, CacheKey};
use super::store::TokenCacheStore;
use crate::error::CacheError;

/// Cache file name.
const CACHE_FILE: &str = "token_cache.json";

/// On-disk format version.
const CACHE_VERSION: u32 = 1;

/// Write locks shared by every [`FileTokenCache`] in the process, one per path.
static PATH_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    // Canonicalize the parent so two spellings of one file share a lock
    let key = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    };
    Arc::clone(PATH_LOCKS.lock().entry(key).or_default())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    items: Vec<CacheItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheItem {
    key: CacheKey,
    entry: CacheEntry,
}

/// Token cache backed by a single JSON file.
///
/// Every write goes to a uniquely named sibling temp file that is renamed over
/// the target, so readers never observe a half-written cache. Read-modify-write
/// cycles are serialized across all instances in the process that share a
/// path; separate processes are last-writer-wins.
#[derive(Debug)]
pub struct FileTokenCache {
    path: PathBuf,
}

impl FileTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache file in the platform data directory.
    ///
    /// Returns `~/Library/Application Support/de.malvik.aadauth/token_cache.json` on macOS.
    pub fn default_location() -> Result<Self, CacheError> {
        default_cache_path().map(Self::new).ok_or_else(|| {
            CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine data directory",
            ))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CacheDocument, CacheError> {
        if !self.path.exists() {
            return Ok(CacheDocument {
                version: CACHE_VERSION,
                items: Vec::new(),
            });
        }

        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<CacheDocument>(&content) {
            Ok(doc) if doc.version == CACHE_VERSION => Ok(doc),
            Ok(doc) => {
                warn!(version = doc.version, path = ?self.path, "Unsupported token cache version, starting empty");
                Ok(CacheDocument {
                    version: CACHE_VERSION,
                    items: Vec::new(),
                })
            }
            Err(e) => {
                warn!(error = %e, path = ?self.path, "Token cache is corrupted, starting empty");
                Ok(CacheDocument {
                    version: CACHE_VERSION,
                    items: Vec::new(),
                })
            }
        }
    }

    fn save(&self, doc: &CacheDocument) -> Result<(), CacheError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let content = serde_json::to_vec_pretty(doc)?;

        // Created owner read/write only on unix
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;

        debug!(path = ?self.path, items = doc.items.len(), "Saved token cache");
        Ok(())
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<CacheItem>) -> R) -> Result<R, CacheError> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock();
        let mut doc = self.load()?;
        let result = f(&mut doc.items);
        self.save(&doc)?;
        Ok(result)
    }
}

/// Default cache file path in the platform data directory.
pub fn default_cache_path() -> Option<PathBuf> {
    ProjectDirs::from("de", "malvik", "aadauth").map(|dirs| dirs.data_dir().join(CACHE_FILE))
}

impl TokenCacheStore for FileTokenCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .find(|item| item.key == *key)
            .map(|item| item.entry))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        self.update(|items| {
            items.retain(|item| item.key != *key);
            items.push(CacheItem {
                key: key.clone(),
                entry: entry.clone(),
            });
        })
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.update(|items| items.retain(|item| item.key != *key))
    }

    fn items_matching(&self, filter: &CacheFilter) -> Result<Vec<(CacheKey, CacheEntry)>, CacheError> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .filter(|item| filter.matches(&item.key))
            .map(|item| (item.key, item.entry))
            .collect())
    }

    fn remove_all_matching(&self, filter: &CacheFilter) -> Result<usize, CacheError> {
        self.update(|items| {
            let before = items.len();
            items.retain(|item| !filter.matches(&item.key));
            before - items.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::tests::make_entry;

    const AUTHORITY: &str = "https://login.windows.net/contoso.com";

    #[test]
    fn test_default_path() {
        let path = default_cache_path();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with(CACHE_FILE));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CACHE_FILE);
        let key = CacheKey::new(AUTHORITY, ["b", "a"], "abc", Some("user-1"));

        let cache = FileTokenCache::new(&path);
        cache.store(&key, &make_entry(3600, Some("rt-1"))).unwrap();
        drop(cache);

        let reopened = FileTokenCache::new(&path);
        let entry = reopened
            .lookup(&CacheKey::new(AUTHORITY, ["a", "b"], "abc", Some("user-1")))
            .unwrap()
            .unwrap();
        assert_eq!(entry.refresh_token.unwrap().as_str(), "rt-1");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != CACHE_FILE)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        let cache = FileTokenCache::new(&path);
        cache
            .store(&CacheKey::new(AUTHORITY, ["a"], "abc", None), &make_entry(3600, None))
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_concurrent_instances_on_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let cache = FileTokenCache::new(path);
                    for i in 0..50 {
                        let key = CacheKey::new(AUTHORITY, [format!("scope-{t}-{i}")], "abc", None);
                        cache.store(&key, &make_entry(3600, None)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let cache = FileTokenCache::new(&path);
        assert_eq!(cache.items_matching(&CacheFilter::new()).unwrap().len(), 200);
    }

    #[test]
    fn test_store_replaces_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileTokenCache::new(dir.path().join(CACHE_FILE));
        let key = CacheKey::new(AUTHORITY, ["resource.read"], "abc", None);

        cache.store(&key, &make_entry(3600, Some("old"))).unwrap();
        cache.store(&key, &make_entry(3600, Some("new"))).unwrap();
        cache
            .store(&CacheKey::new(AUTHORITY, ["other"], "xyz", None), &make_entry(3600, None))
            .unwrap();

        let all = cache.items_matching(&CacheFilter::new()).unwrap();
        assert_eq!(all.len(), 2);

        let entry = cache.lookup(&key).unwrap().unwrap();
        assert_eq!(entry.refresh_token.unwrap().as_str(), "new");

        let removed = cache
            .remove_all_matching(&CacheFilter::new().client_id("abc"))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&key).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE);
        fs::write(&path, "{ not json").unwrap();

        let cache = FileTokenCache::new(&path);
        assert!(cache.items_matching(&CacheFilter::new()).unwrap().is_empty());

        let key = CacheKey::new(AUTHORITY, ["resource.read"], "abc", None);
        cache.store(&key, &make_entry(3600, None)).unwrap();
        assert!(cache.lookup(&key).unwrap().is_some());
    }
}
