//! Token cache model and stores.
//!
//! [`CacheKey`] and [`CacheEntry`] describe what is cached; [`TokenCacheStore`]
//! is the pluggable persistence contract, with in-memory and file-backed
//! implementations provided here (and a Keychain store on macOS).

pub mod entry;
pub mod file;
pub mod key;
pub mod secure;
pub mod store;

pub use entry::{CacheEntry, UserInformation};
pub use file::FileTokenCache;
pub use key::{normalize_scopes, CacheFilter, CacheKey};
pub use secure::SecureString;
pub use store::{MemoryTokenCache, TokenCacheStore};
