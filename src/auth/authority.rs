//! Authority parsing and validation.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::transport::HttpTransport;
use crate::error::AuthError;

/// Azure AD instances accepted without a discovery round-trip.
pub const TRUSTED_HOSTS: [&str; 6] = [
    "login.windows.net",
    "login.microsoftonline.com",
    "login.chinacloudapi.cn",
    "login.microsoftonline.de",
    "login-us.microsoftonline.com",
    "login.microsoftonline.us",
];

const DISCOVERY_API_VERSION: &str = "1.0";

/// Authorities validated by any validator sharing the process-wide set.
/// Entries are only ever added.
static VALIDATED_AUTHORITIES: Lazy<Arc<RwLock<HashSet<String>>>> =
    Lazy::new(|| Arc::new(RwLock::new(HashSet::new())));

/// A canonical authority URL, e.g. `https://login.windows.net/contoso.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    canonical: String,
    host: String,
    tenant: String,
    token_endpoint: Url,
    authorize_endpoint: Url,
}

impl Authority {
    pub fn parse(authority: &str) -> Result<Self, AuthError> {
        let trimmed = authority.trim();
        if trimmed.is_empty() {
            return Err(AuthError::InvalidAuthority("authority is empty".into()));
        }

        let url = Url::parse(trimmed)
            .map_err(|e| AuthError::InvalidAuthority(format!("{}: {}", trimmed, e)))?;

        if url.scheme() != "https" {
            return Err(AuthError::InvalidAuthority(format!(
                "{}: authority must use https",
                trimmed
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(AuthError::InvalidAuthority(format!(
                "{}: authority must not carry a query or fragment",
                trimmed
            )));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_lowercase(),
            _ => return Err(AuthError::InvalidAuthority(format!("{}: missing host", trimmed))),
        };

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let tenant = match segments.first() {
            Some(tenant) => tenant.to_string(),
            None => {
                return Err(AuthError::InvalidAuthority(format!(
                    "{}: missing tenant path segment",
                    trimmed
                )))
            }
        };

        let host_port = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let canonical = format!("https://{}/{}", host_port, segments.join("/"));
        let endpoint = |suffix: &str| {
            Url::parse(&format!("{}/oauth2/{}", canonical, suffix))
                .map_err(|e| AuthError::InvalidAuthority(format!("{}: {}", canonical, e)))
        };

        Ok(Self {
            token_endpoint: endpoint("token")?,
            authorize_endpoint: endpoint("authorize")?,
            canonical,
            host,
            tenant,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// First path segment: the tenant, or `adfs`.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn is_adfs(&self) -> bool {
        self.tenant.eq_ignore_ascii_case("adfs")
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub fn authorize_endpoint(&self) -> &Url {
        &self.authorize_endpoint
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    tenant_discovery_endpoint: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

fn is_well_known_host(host: &str) -> bool {
    TRUSTED_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Checks an authority against the trusted instance list, falling back to
/// instance discovery for unknown hosts.
#[derive(Debug, Clone)]
pub struct AuthorityValidator {
    trusted_hosts: Vec<String>,
    discovery_enabled: bool,
    validated: Arc<RwLock<HashSet<String>>>,
}

impl Default for AuthorityValidator {
    fn default() -> Self {
        Self {
            trusted_hosts: TRUSTED_HOSTS.iter().map(|h| h.to_string()).collect(),
            discovery_enabled: true,
            validated: Arc::clone(&VALIDATED_AUTHORITIES),
        }
    }
}

impl AuthorityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a private validated set instead of the process-wide one.
    pub fn with_isolated_cache(mut self) -> Self {
        self.validated = Arc::new(RwLock::new(HashSet::new()));
        self
    }

    /// Extend the trusted instance list.
    pub fn with_trusted_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for host in hosts {
            let host = host.as_ref().trim().to_lowercase();
            if !host.is_empty() && !self.trusted_hosts.contains(&host) {
                self.trusted_hosts.push(host);
            }
        }
        self
    }

    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    pub fn is_trusted_host(&self, host: &str) -> bool {
        self.trusted_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Whether the authority was validated earlier in this process.
    pub fn is_validated(&self, authority: &Authority) -> bool {
        self.validated.read().contains(authority.as_str())
    }

    fn record(&self, authority: &Authority) {
        self.validated.write().insert(authority.as_str().to_string());
    }

    pub async fn validate(
        &self,
        authority: &Authority,
        transport: &dyn HttpTransport,
        correlation_id: Uuid,
    ) -> Result<(), AuthError> {
        if authority.is_adfs() {
            return Err(AuthError::AuthorityNotValidated(format!(
                "{}: validation is not supported for ADFS authorities",
                authority
            )));
        }

        if self.is_validated(authority) {
            return Ok(());
        }

        if self.is_trusted_host(authority.host()) {
            debug!(authority = %authority, "Authority host is trusted");
            // Hosts added with `with_trusted_hosts` are trusted by this validator only
            if is_well_known_host(authority.host()) {
                self.record(authority);
            }
            return Ok(());
        }

        if !self.discovery_enabled {
            return Err(AuthError::AuthorityNotValidated(format!(
                "{}: host is not a trusted instance",
                authority
            )));
        }

        self.discover(authority, transport, correlation_id).await?;
        info!(authority = %authority, %correlation_id, "Authority validated by instance discovery");
        self.record(authority);
        Ok(())
    }

    async fn discover(
        &self,
        authority: &Authority,
        transport: &dyn HttpTransport,
        correlation_id: Uuid,
    ) -> Result<(), AuthError> {
        let discovery_host = self
            .trusted_hosts
            .first()
            .map(String::as_str)
            .unwrap_or(TRUSTED_HOSTS[0]);

        let mut url = Url::parse(&format!("https://{}/common/discovery/instance", discovery_host))
            .map_err(|e| AuthError::AuthorityNotValidated(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("api-version", DISCOVERY_API_VERSION)
            .append_pair("authorization_endpoint", authority.authorize_endpoint().as_str());

        let response = match transport.get(&url, correlation_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(authority = %authority, error = %e, "Instance discovery request failed");
                return Err(AuthError::AuthorityNotValidated(format!(
                    "{}: instance discovery failed: {}",
                    authority, e
                )));
            }
        };

        let body: DiscoveryResponse = serde_json::from_str(&response.body).map_err(|e| {
            AuthError::AuthorityNotValidated(format!(
                "{}: unreadable discovery response (HTTP {}): {}",
                authority, response.status, e
            ))
        })?;

        match body {
            DiscoveryResponse {
                tenant_discovery_endpoint: Some(_),
                ..
            } if response.is_success() => Ok(()),
            DiscoveryResponse {
                error,
                error_description,
                ..
            } => {
                let reason = error_description
                    .or(error)
                    .unwrap_or_else(|| format!("HTTP {}", response.status));
                warn!(authority = %authority, %reason, "Authority rejected by instance discovery");
                Err(AuthError::AuthorityNotValidated(format!("{}: {}", authority, reason)))
            }
        }
    }
}
