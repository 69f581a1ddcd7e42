//! Cache keys and filters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Canonical key of a cached token.
///
/// Scopes are normalized into a sorted, de-duplicated set so that requests for
/// `["b", "a"]` and `["a", "b"]` resolve to the same entry. Authority and client id
/// are compared case-insensitively; scopes are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    authority: String,
    scopes: BTreeSet<String>,
    client_id: String,
    user_id: Option<String>,
}

impl CacheKey {
    pub fn new<I, S>(authority: &str, scopes: I, client_id: &str, user_id: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            authority: normalize_authority(authority),
            scopes: normalize_scopes(scopes),
            client_id: client_id.trim().to_lowercase(),
            user_id: user_id.map(str::to_string),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Same key bound to a different user.
    pub fn for_user(&self, user_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            ..self.clone()
        }
    }

    /// Space-delimited scope string as sent on the wire.
    pub fn scope_string(&self) -> String {
        join_scopes(&self.scopes)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.authority,
            self.scope_string(),
            self.client_id,
            self.user_id.as_deref().unwrap_or("")
        )
    }
}

/// Selects cache entries by any combination of key components.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFilter {
    authority: Option<String>,
    client_id: Option<String>,
    scopes: Option<BTreeSet<String>>,
    user_id: Option<String>,
}

impl CacheFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter selecting every user for the given key's authority, scopes and client.
    pub fn for_key_any_user(key: &CacheKey) -> Self {
        Self {
            authority: Some(key.authority.clone()),
            client_id: Some(key.client_id.clone()),
            scopes: Some(key.scopes.clone()),
            user_id: None,
        }
    }

    pub fn authority(mut self, authority: &str) -> Self {
        self.authority = Some(normalize_authority(authority));
        self
    }

    pub fn client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.trim().to_lowercase());
        self
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scopes = Some(normalize_scopes(scopes));
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        self.authority.as_ref().map_or(true, |a| *a == key.authority)
            && self.client_id.as_ref().map_or(true, |c| *c == key.client_id)
            && self.scopes.as_ref().map_or(true, |s| *s == key.scopes)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| key.user_id.as_deref() == Some(u.as_str()))
    }
}

/// Trim, drop empties, de-duplicate (case-sensitive) and sort.
pub fn normalize_scopes<I, S>(scopes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    scopes
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn join_scopes(scopes: &BTreeSet<String>) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn normalize_authority(authority: &str) -> String {
    authority.trim().trim_end_matches('/').to_lowercase()
}
