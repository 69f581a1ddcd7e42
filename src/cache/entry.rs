//! Cached token entries and the user identity attached to them.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::secure::SecureString;
use crate::error::AuthError;

/// An access/refresh token pair with expiry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub access_token: SecureString,

    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub access_token_type: String,

    #[serde(default)]
    pub refresh_token: Option<SecureString>,

    /// When the access token expires.
    pub expires_on: DateTime<Utc>,

    /// Scopes the entry was issued for.
    pub scopes: BTreeSet<String>,

    /// Identity parsed from the id token, if one was returned.
    #[serde(default)]
    pub user: Option<UserInformation>,

    /// Family of client ids allowed to share the refresh token.
    #[serde(default)]
    pub family_id: Option<String>,

    pub authority: String,
    pub client_id: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl CacheEntry {
    /// True when the access token expires within `skew` of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match now.checked_add_signed(skew) {
            Some(deadline) => self.expires_on <= deadline,
            // Past the end of time every token has expired; before its start none has.
            None => skew > Duration::zero(),
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_ref().is_some_and(|rt| !rt.is_empty())
    }

    /// Unique id of the owning user, used as the user component of the cache key.
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.unique_id.as_deref())
    }

    pub fn displayable_id(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.displayable_id.as_deref())
    }

    /// Time remaining until the access token expires, if it has not already.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_on > now).then(|| self.expires_on - now)
    }
}

/// User identity carried by an id token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInformation {
    /// Stable object id (`oid`, falling back to `sub`).
    pub unique_id: Option<String>,

    /// Human-readable sign-in name (UPN or email).
    pub displayable_id: Option<String>,

    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub tenant_id: Option<String>,
    pub identity_provider: Option<String>,

    /// All claims from the id token payload.
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl UserInformation {
    /// Parse the payload segment of an id token.
    ///
    /// The signature is not verified; the token arrives over TLS straight from
    /// the token endpoint and is used for cache bookkeeping only.
    pub fn from_id_token(id_token: &str) -> Result<Self, AuthError> {
        let mut segments = id_token.split('.');
        let payload = segments
            .nth(1)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("Malformed id_token".into()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::InvalidResponse(format!("Failed decoding id_token: {}", e)))?;

        let claims: Map<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::InvalidResponse(format!("Failed parsing id_token: {}", e)))?;

        Ok(Self::from_claims(claims))
    }

    fn from_claims(claims: Map<String, Value>) -> Self {
        let claim = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| claims.get(*n).and_then(Value::as_str))
                .map(str::to_string)
        };

        Self {
            unique_id: claim(&["oid", "sub"]),
            displayable_id: claim(&["upn", "email", "preferred_username", "unique_name"]),
            given_name: claim(&["given_name"]),
            family_name: claim(&["family_name"]),
            tenant_id: claim(&["tid"]),
            identity_provider: claim(&["idp", "iss"]),
            claims,
        }
    }

    /// Case-insensitive comparison against the displayable id.
    pub fn matches_displayable_id(&self, id: &str) -> bool {
        self.displayable_id
            .as_deref()
            .is_some_and(|d| d.eq_ignore_ascii_case(id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an unsigned JWT carrying the given claims.
    pub(crate) fn make_id_token(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.", header, payload)
    }

    pub(crate) fn make_entry(expires_in_secs: i64, refresh_token: Option<&str>) -> CacheEntry {
        CacheEntry {
            access_token: SecureString::new("cached-at"),
            access_token_type: "Bearer".into(),
            refresh_token: refresh_token.map(SecureString::new),
            expires_on: Utc::now() + Duration::seconds(expires_in_secs),
            scopes: ["resource.read".to_string()].into_iter().collect(),
            user: None,
            family_id: None,
            authority: "https://login.windows.net/contoso.com".into(),
            client_id: "abc".into(),
        }
    }

    #[test]
    fn test_expiry_with_skew() {
        let now = Utc::now();
        let entry = make_entry(600, None);
        assert!(!entry.is_expired(now, Duration::minutes(5)));
        assert!(entry.is_expired(now, Duration::minutes(11)));

        let expired = make_entry(-10, Some("rt"));
        assert!(expired.is_expired(now, Duration::zero()));
        assert!(expired.has_refresh_token());
        assert!(expired.time_until_expiry(now).is_none());
    }

    #[test]
    fn test_expiry_with_out_of_range_skew() {
        let now = Utc::now();
        let entry = make_entry(600, Some("rt"));
        assert!(entry.is_expired(now, Duration::weeks(1_000_000_000)));
        assert!(!entry.is_expired(now, -Duration::weeks(1_000_000_000)));
    }

    #[test]
    fn test_user_from_id_token() {
        let token = make_id_token(serde_json::json!({
            "oid": "0000-1111",
            "sub": "subject",
            "upn": "Jane@Contoso.com",
            "given_name": "Jane",
            "tid": "tenant-1"
        }));

        let user = UserInformation::from_id_token(&token).unwrap();
        assert_eq!(user.unique_id.as_deref(), Some("0000-1111"));
        assert_eq!(user.displayable_id.as_deref(), Some("Jane@Contoso.com"));
        assert_eq!(user.tenant_id.as_deref(), Some("tenant-1"));
        assert!(user.matches_displayable_id("jane@contoso.com"));
        assert_eq!(user.claims.get("sub").and_then(Value::as_str), Some("subject"));
    }

    #[test]
    fn test_user_falls_back_to_sub_and_email() {
        let token = make_id_token(serde_json::json!({
            "sub": "subject",
            "email": "bob@example.com"
        }));

        let user = UserInformation::from_id_token(&token).unwrap();
        assert_eq!(user.unique_id.as_deref(), Some("subject"));
        assert_eq!(user.displayable_id.as_deref(), Some("bob@example.com"));
    }

    #[test]
    fn test_malformed_id_token() {
        assert!(matches!(
            UserInformation::from_id_token("not-a-jwt"),
            Err(AuthError::InvalidResponse(_))
        ));
        assert!(matches!(
            UserInformation::from_id_token("a.!!!.c"),
            Err(AuthError::InvalidResponse(_))
        ));
    }
}
