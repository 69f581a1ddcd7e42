//! macOS Keychain token cache.
//!
//! Each cache entry is stored as a generic password item whose account name is a
//! hash of the cache key. An index item lists every account so the cache can be
//! enumerated and filtered.

use parking_lot::Mutex;
use security_framework::passwords::{
    delete_generic_password, get_generic_password, set_generic_password,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cache::{CacheEntry, CacheFilter, CacheKey, TokenCacheStore};
use crate::error::CacheError;

/// Keychain service identifier.
const SERVICE: &str = "de.malvik.aadauth.tokencache";

/// Account holding the list of stored entry accounts.
const ACCOUNT_INDEX: &str = "aadauth_index";

#[derive(Serialize, Deserialize)]
struct KeychainItem {
    key: CacheKey,
    entry: CacheEntry,
}

/// Token cache stored in the login Keychain.
#[derive(Debug, Default)]
pub struct KeychainTokenCache {
    /// Serializes index updates within this process.
    index_lock: Mutex<()>,
}

impl KeychainTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_item(&self, account: &str) -> Result<Option<KeychainItem>, CacheError> {
        let bytes = match get_generic_password(SERVICE, account) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if is_not_found_error(&e) => return Ok(None),
            Err(e) => return Err(CacheError::RetrieveFailed(e.to_string())),
        };

        match serde_json::from_slice(&bytes) {
            Ok(item) => Ok(Some(item)),
            Err(e) => {
                warn!(account, error = %e, "Dropping unreadable keychain cache item");
                Ok(None)
            }
        }
    }

    fn read_index(&self) -> Result<Vec<String>, CacheError> {
        match get_generic_password(SERVICE, ACCOUNT_INDEX) {
            Ok(bytes) => Ok(parse_index(&bytes)),
            Err(e) if is_not_found_error(&e) => Ok(Vec::new()),
            Err(e) => Err(CacheError::RetrieveFailed(e.to_string())),
        }
    }

    fn write_index(&self, accounts: &[String]) -> Result<(), CacheError> {
        let json = serde_json::to_vec(accounts)?;
        set_generic_password(SERVICE, ACCOUNT_INDEX, &json)
            .map_err(|e| CacheError::StoreFailed(e.to_string()))
    }

    fn delete_account(&self, account: &str) -> Result<(), CacheError> {
        match delete_generic_password(SERVICE, account) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found_error(&e) => Ok(()),
            Err(e) => Err(CacheError::DeleteFailed(e.to_string())),
        }
    }
}

impl TokenCacheStore for KeychainTokenCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .read_item(&account_for(key))?
            .filter(|item| item.key == *key)
            .map(|item| item.entry))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let account = account_for(key);
        let json = Zeroizing::new(serde_json::to_vec(&KeychainItem {
            key: key.clone(),
            entry: entry.clone(),
        })?);

        let _guard = self.index_lock.lock();
        set_generic_password(SERVICE, &account, &json)
            .map_err(|e| CacheError::StoreFailed(e.to_string()))?;

        let mut index = self.read_index()?;
        if !index.contains(&account) {
            index.push(account);
            self.write_index(&index)?;
        }
        debug!("Stored token in keychain");
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let account = account_for(key);
        let _guard = self.index_lock.lock();
        self.delete_account(&account)?;

        let mut index = self.read_index()?;
        index.retain(|a| *a != account);
        self.write_index(&index)
    }

    fn items_matching(&self, filter: &CacheFilter) -> Result<Vec<(CacheKey, CacheEntry)>, CacheError> {
        let mut items = Vec::new();
        for account in self.read_index()? {
            if let Some(item) = self.read_item(&account)? {
                if filter.matches(&item.key) {
                    items.push((item.key, item.entry));
                }
            }
        }
        Ok(items)
    }

    fn remove_all_matching(&self, filter: &CacheFilter) -> Result<usize, CacheError> {
        let _guard = self.index_lock.lock();
        let index = self.read_index()?;
        let mut kept = Vec::with_capacity(index.len());
        let mut removed = 0;

        for account in index {
            match self.read_item(&account)? {
                Some(item) if !filter.matches(&item.key) => kept.push(account),
                Some(_) => {
                    self.delete_account(&account)?;
                    removed += 1;
                }
                // Stale index entry
                None => {}
            }
        }

        self.write_index(&kept)?;
        Ok(removed)
    }
}

/// Keychain account name for a cache key.
fn account_for(key: &CacheKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    let hash = hasher.finalize();
    format!("aadauth_{:x}", hash)[..40].to_string()
}

/// Decode the account index. A corrupt index is logged and treated as empty;
/// entries it listed stay reachable by key but drop out of enumeration.
fn parse_index(bytes: &[u8]) -> Vec<String> {
    match serde_json::from_slice(bytes) {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "Keychain cache index is unreadable, rebuilding it");
            Vec::new()
        }
    }
}

/// Helper to check if a security framework error is "item not found".
fn is_not_found_error(error: &security_framework::base::Error) -> bool {
    // errSecItemNotFound = -25300
    error.code() == -25300
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::tests::make_entry;

    const AUTHORITY: &str = "https://login.windows.net/contoso.com";

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index(br#"["a1","b2"]"#), vec!["a1".to_string(), "b2".to_string()]);
        assert!(parse_index(b"{ corrupt").is_empty());
        assert!(parse_index(br#"{"a1":true}"#).is_empty());
    }

    #[test]
    fn test_account_is_stable_per_key() {
        let a = CacheKey::new(AUTHORITY, ["b", "a"], "abc", None);
        let b = CacheKey::new(AUTHORITY, ["a", "b"], "abc", None);
        assert_eq!(account_for(&a), account_for(&b));
        assert_ne!(account_for(&a), account_for(&a.for_user(Some("u1"))));
        assert!(account_for(&a).starts_with("aadauth_"));
    }

    // Note: These tests require Keychain access and may prompt for permission

    #[test]
    #[ignore = "requires keychain access"]
    fn test_store_and_lookup() {
        let cache = KeychainTokenCache::new();
        let key = CacheKey::new(AUTHORITY, ["keychain.test"], "abc", None);

        cache.store(&key, &make_entry(3600, Some("rt"))).expect("Failed to store entry");
        let entry = cache.lookup(&key).expect("Failed to read entry").unwrap();
        assert_eq!(entry.access_token.as_str(), "cached-at");

        cache.remove(&key).expect("Failed to remove entry");
        assert!(cache.lookup(&key).unwrap().is_none());
    }

    #[test]
    #[ignore = "requires keychain access"]
    fn test_remove_all_matching() {
        let cache = KeychainTokenCache::new();
        let key = CacheKey::new(AUTHORITY, ["keychain.test"], "abc", Some("u1"));
        cache.store(&key, &make_entry(3600, None)).expect("Failed to store entry");

        let removed = cache
            .remove_all_matching(&CacheFilter::new().user_id("u1"))
            .expect("Failed to clear entries");
        assert!(removed >= 1);
        assert!(cache.lookup(&key).unwrap().is_none());
    }
}
