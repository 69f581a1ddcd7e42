//! Token acquisition: cache lookup, silent refresh and the interactive,
//! silent and assertion flows.

use chrono::{Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::authority::Authority;
use super::broker::{AuthorizationOutcome, AuthorizationRequest, InteractiveAuthBroker};
use super::oauth::{
    build_authorization_url, generate_state, parse_callback_url, wire_scope, AuthorizationParams, OAuth2Client,
    PkceChallenge,
};
use super::request::{AssertionType, IdentifierKind, TokenRequest, UserIdentifier};
use super::transport::HttpTransport;
use crate::cache::{normalize_scopes, CacheEntry, CacheFilter, CacheKey, TokenCacheStore};
use crate::error::AuthError;

/// Default margin before expiry at which a cached token is treated as expired.
pub const DEFAULT_EXPIRATION_SKEW_SECS: i64 = 300;

/// How a request may be satisfied once the cache has nothing usable.
#[derive(Debug, Clone, Copy)]
enum Flow<'a> {
    Interactive,
    Silent,
    Assertion {
        assertion: &'a str,
        assertion_type: AssertionType,
    },
}

impl Flow<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Silent => "silent",
            Self::Assertion { .. } => "assertion",
        }
    }
}

/// Acquires tokens for one authority, consulting the cache before the network.
pub struct TokenAcquisitionEngine {
    authority: Authority,
    cache: Option<Arc<dyn TokenCacheStore>>,
    transport: Arc<dyn HttpTransport>,
    broker: Option<Arc<dyn InteractiveAuthBroker>>,
    application_url_scheme: Option<String>,
    expiration_skew: Duration,
}

impl TokenAcquisitionEngine {
    pub fn new(authority: Authority, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            authority,
            cache: None,
            transport,
            broker: None,
            application_url_scheme: None,
            expiration_skew: Duration::seconds(DEFAULT_EXPIRATION_SKEW_SECS),
        }
    }

    /// Store used for lookups and write-back; `None` disables caching.
    pub fn with_cache(mut self, cache: Option<Arc<dyn TokenCacheStore>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_broker(mut self, broker: Option<Arc<dyn InteractiveAuthBroker>>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_application_url_scheme(mut self, scheme: Option<String>) -> Self {
        self.application_url_scheme = scheme;
        self
    }

    pub fn with_expiration_skew(mut self, skew: Duration) -> Self {
        self.expiration_skew = skew;
        self
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn cache(&self) -> Option<&Arc<dyn TokenCacheStore>> {
        self.cache.as_ref()
    }

    /// Interactive flow: cache, then refresh token, then the broker.
    pub async fn acquire_token(&self, request: &TokenRequest, correlation_id: Uuid) -> Result<CacheEntry, AuthError> {
        self.acquire(request, Flow::Interactive, correlation_id).await
    }

    /// Cache and refresh token only; never shows UI.
    pub async fn acquire_token_silent(
        &self,
        request: &TokenRequest,
        correlation_id: Uuid,
    ) -> Result<CacheEntry, AuthError> {
        self.acquire(request, Flow::Silent, correlation_id).await
    }

    /// Cache and refresh token, then exchange the user assertion; never shows UI.
    pub async fn acquire_token_for_assertion(
        &self,
        assertion: &str,
        assertion_type: AssertionType,
        request: &TokenRequest,
        correlation_id: Uuid,
    ) -> Result<CacheEntry, AuthError> {
        if assertion.trim().is_empty() {
            return Err(AuthError::InvalidArgument("assertion is empty".into()));
        }
        let flow = Flow::Assertion {
            assertion,
            assertion_type,
        };
        self.acquire(request, flow, correlation_id).await
    }

    async fn acquire(&self, request: &TokenRequest, flow: Flow<'_>, correlation_id: Uuid) -> Result<CacheEntry, AuthError> {
        let scopes = normalize_scopes(&request.scopes);
        if scopes.is_empty() {
            return Err(AuthError::InvalidArgument("at least one scope is required".into()));
        }
        if request.client_id.trim().is_empty() {
            return Err(AuthError::InvalidArgument("client_id is required".into()));
        }

        info!(
            %correlation_id,
            authority = %self.authority,
            client_id = %request.client_id,
            flow = flow.name(),
            "Acquiring token"
        );

        let skip_cache = matches!(flow, Flow::Interactive) && request.prompt_behavior.bypasses_cache();
        if skip_cache {
            debug!(%correlation_id, prompt = ?request.prompt_behavior, "Prompt behavior bypasses the cache");
        } else if let Some(entry) = self.try_cache(request, &scopes, correlation_id).await? {
            return Ok(entry);
        }

        match flow {
            Flow::Silent => {
                info!(%correlation_id, "No usable cached token, user interaction required");
                Err(AuthError::UserInputRequired)
            }
            Flow::Assertion {
                assertion,
                assertion_type,
            } => {
                self.acquire_by_assertion(request, &scopes, assertion, assertion_type, correlation_id)
                    .await
            }
            Flow::Interactive => self.acquire_interactive(request, &scopes, correlation_id).await,
        }
    }

    /// Cache hit, refresh of the cached entry, or refresh via another entry's
    /// refresh token. `Ok(None)` means the caller has to fall through.
    async fn try_cache(
        &self,
        request: &TokenRequest,
        scopes: &BTreeSet<String>,
        correlation_id: Uuid,
    ) -> Result<Option<CacheEntry>, AuthError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let base = CacheKey::new(self.authority.as_str(), scopes, &request.client_id, None);
        let mut filter = CacheFilter::for_key_any_user(&base);
        if let Some(id) = unique_id(request.user.as_ref()) {
            filter = filter.user_id(id);
        }

        let candidate = select_for_user(cache.items_matching(&filter)?, request.user.as_ref())?;

        if let Some((key, entry)) = candidate {
            let now = Utc::now();
            if !entry.is_expired(now, self.expiration_skew) {
                debug!(%correlation_id, key = %key, "Cache hit");
                return Ok(Some(entry));
            }

            if entry.has_refresh_token() {
                match self.refresh_entry(&**cache, &key, entry, request, correlation_id).await {
                    Ok(entry) => return Ok(Some(entry)),
                    Err(AuthError::InvalidGrant { description }) => {
                        warn!(%correlation_id, %description, "Refresh token rejected, evicting cache entry");
                        self.evict(&**cache, &key);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!(%correlation_id, key = %key, "Expired entry has no refresh token, evicting");
                self.evict(&**cache, &key);
            }
        }

        self.try_broad_refresh(&**cache, request, scopes, correlation_id)
            .await
    }

    async fn refresh_entry(
        &self,
        cache: &dyn TokenCacheStore,
        key: &CacheKey,
        mut entry: CacheEntry,
        request: &TokenRequest,
        correlation_id: Uuid,
    ) -> Result<CacheEntry, AuthError> {
        let refresh_token = entry
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::InvalidArgument("entry has no refresh token".into()))?;

        debug!(%correlation_id, key = %key, "Refreshing access token");
        let response = self
            .client(request, correlation_id)
            .refresh_token(
                refresh_token.as_str(),
                &wire_scope(key.scopes(), &request.additional_scopes),
            )
            .await?;

        response.merge_into(&mut entry, Utc::now());
        check_user(request.user.as_ref(), &entry)?;

        if let Some(new_key) = self.save(&entry, key.scopes(), &request.client_id) {
            if new_key != *key {
                self.evict(cache, key);
            }
        }

        info!(%correlation_id, "Token refreshed successfully");
        Ok(entry)
    }

    /// Use a refresh token cached for other scopes of the same user and client.
    async fn try_broad_refresh(
        &self,
        cache: &dyn TokenCacheStore,
        request: &TokenRequest,
        scopes: &BTreeSet<String>,
        correlation_id: Uuid,
    ) -> Result<Option<CacheEntry>, AuthError> {
        let mut filter = CacheFilter::new()
            .authority(self.authority.as_str())
            .client_id(&request.client_id);
        if let Some(id) = unique_id(request.user.as_ref()) {
            filter = filter.user_id(id);
        }

        let donors = cache
            .items_matching(&filter)?
            .into_iter()
            .filter(|(key, entry)| key.scopes() != scopes && entry.has_refresh_token());

        let Some((donor_key, mut donor)) = select_for_user(latest_per_user(donors), request.user.as_ref())? else {
            return Ok(None);
        };
        let Some(refresh_token) = donor.refresh_token.clone() else {
            return Ok(None);
        };

        debug!(%correlation_id, donor = %donor_key, "Requesting new scopes with a broad refresh token");
        let result = self
            .client(request, correlation_id)
            .refresh_token(
                refresh_token.as_str(),
                &wire_scope(scopes, &request.additional_scopes),
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(AuthError::InvalidGrant { description }) => {
                warn!(%correlation_id, %description, "Broad refresh token rejected, evicting donor entry");
                self.evict(cache, &donor_key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut entry = response.into_entry(self.authority.as_str(), &request.client_id, scopes, Utc::now());
        if entry.user.is_none() {
            entry.user = donor.user.clone();
        }
        if entry.refresh_token.is_none() {
            entry.refresh_token = Some(refresh_token);
        }
        check_user(request.user.as_ref(), &entry)?;

        // Keep the donor in step with a rotated refresh token
        if entry.refresh_token != donor.refresh_token {
            donor.refresh_token = entry.refresh_token.clone();
            if let Err(e) = cache.store(&donor_key, &donor) {
                warn!(%correlation_id, error = %e, "Failed to update donor entry");
            }
        }

        self.save(&entry, scopes, &request.client_id);
        info!(%correlation_id, "Token acquired with broad refresh token");
        Ok(Some(entry))
    }

    async fn acquire_interactive(
        &self,
        request: &TokenRequest,
        scopes: &BTreeSet<String>,
        correlation_id: Uuid,
    ) -> Result<CacheEntry, AuthError> {
        let Some(broker) = &self.broker else {
            info!(%correlation_id, "No interactive broker configured");
            return Err(AuthError::UserInputRequired);
        };
        let redirect_uri = request
            .redirect_uri
            .as_ref()
            .ok_or_else(|| AuthError::InvalidArgument("redirect_uri is required for interactive sign-in".into()))?;

        let pkce = PkceChallenge::new();
        let state = generate_state();
        let scope = wire_scope(scopes, &request.additional_scopes);

        let url = build_authorization_url(
            self.authority.authorize_endpoint(),
            &AuthorizationParams {
                client_id: &request.client_id,
                redirect_uri,
                scope: &scope,
                state: &state,
                pkce: &pkce,
                prompt_behavior: request.prompt_behavior,
                user: request.user.as_ref(),
                policy: request.policy.as_deref(),
                extra_query_parameters: request.extra_query_parameters.as_deref(),
                correlation_id,
            },
        );

        let authorization = AuthorizationRequest {
            url,
            redirect_uri: redirect_uri.clone(),
            state: state.clone(),
            correlation_id,
            application_url_scheme: self.application_url_scheme.clone(),
        };

        let redirect = match broker.authorize(&authorization).await? {
            AuthorizationOutcome::Redirect(redirect) => redirect,
            AuthorizationOutcome::Cancelled => {
                info!(%correlation_id, "User cancelled sign-in");
                return Err(AuthError::UserCancelled);
            }
        };

        let (code, returned_state) = parse_callback_url(&redirect)?;
        if returned_state != state {
            warn!(%correlation_id, "State parameter mismatch on authorization redirect");
            return Err(AuthError::StateMismatch);
        }

        let response = self
            .client(request, correlation_id)
            .exchange_code(&code, redirect_uri, &pkce.verifier, &scope)
            .await?;

        let entry = response.into_entry(self.authority.as_str(), &request.client_id, scopes, Utc::now());
        check_user(request.user.as_ref(), &entry)?;
        self.save(&entry, scopes, &request.client_id);

        info!(%correlation_id, "Interactive sign-in completed");
        Ok(entry)
    }

    async fn acquire_by_assertion(
        &self,
        request: &TokenRequest,
        scopes: &BTreeSet<String>,
        assertion: &str,
        assertion_type: AssertionType,
        correlation_id: Uuid,
    ) -> Result<CacheEntry, AuthError> {
        let response = self
            .client(request, correlation_id)
            .exchange_assertion(
                assertion,
                assertion_type,
                &wire_scope(scopes, &request.additional_scopes),
            )
            .await?;

        let entry = response.into_entry(self.authority.as_str(), &request.client_id, scopes, Utc::now());
        check_user(request.user.as_ref(), &entry)?;
        self.save(&entry, scopes, &request.client_id);

        info!(%correlation_id, assertion_type = ?assertion_type, "Token acquired for assertion");
        Ok(entry)
    }

    fn client(&self, request: &TokenRequest, correlation_id: Uuid) -> OAuth2Client {
        OAuth2Client::new(
            Arc::clone(&self.transport),
            self.authority.token_endpoint().clone(),
            &request.client_id,
            request.policy.as_deref(),
            correlation_id,
        )
    }

    /// Write an entry back under the key derived from its user. Store failures
    /// are logged; the token is still returned to the caller.
    fn save(&self, entry: &CacheEntry, scopes: &BTreeSet<String>, client_id: &str) -> Option<CacheKey> {
        let cache = self.cache.as_ref()?;
        let key = CacheKey::new(self.authority.as_str(), scopes, client_id, entry.user_id());
        if let Err(e) = cache.store(&key, entry) {
            warn!(key = %key, error = %e, "Failed to write token cache entry");
        }
        Some(key)
    }

    fn evict(&self, cache: &dyn TokenCacheStore, key: &CacheKey) {
        if let Err(e) = cache.remove(key) {
            warn!(key = %key, error = %e, "Failed to evict token cache entry");
        }
    }
}

fn unique_id(user: Option<&UserIdentifier>) -> Option<&str> {
    user.filter(|u| u.kind == IdentifierKind::UniqueId)
        .map(|u| u.id.as_str())
}

/// Pick the entry for the requested user among entries that differ only by user.
fn select_for_user(
    mut items: Vec<(CacheKey, CacheEntry)>,
    user: Option<&UserIdentifier>,
) -> Result<Option<(CacheKey, CacheEntry)>, AuthError> {
    if let Some(user) = user.filter(|u| u.kind != IdentifierKind::UniqueId) {
        let (mut matching, others): (Vec<_>, Vec<_>) = items.into_iter().partition(|(_, entry)| {
            entry
                .user
                .as_ref()
                .is_some_and(|u| u.matches_displayable_id(&user.id))
        });

        if !matching.is_empty() {
            matching.sort_by_key(|(_, entry)| entry.expires_on);
            return Ok(matching.pop());
        }
        if user.kind == IdentifierKind::RequiredDisplayableId {
            return Ok(None);
        }
        items = others;
    }

    let users: HashSet<Option<&str>> = items.iter().map(|(key, _)| key.user_id()).collect();
    if users.len() > 1 {
        return Err(AuthError::MultipleUsersFound);
    }
    Ok(items.pop())
}

/// Collapse entries to the one with the latest expiry per user.
fn latest_per_user(items: impl Iterator<Item = (CacheKey, CacheEntry)>) -> Vec<(CacheKey, CacheEntry)> {
    let mut latest: HashMap<Option<String>, (CacheKey, CacheEntry)> = HashMap::new();
    for (key, entry) in items {
        let user = key.user_id().map(str::to_string);
        match latest.get(&user) {
            Some((_, existing)) if existing.expires_on >= entry.expires_on => {}
            _ => {
                latest.insert(user, (key, entry));
            }
        }
    }
    latest.into_values().collect()
}

/// Reject tokens issued for a different user than the caller required.
fn check_user(user: Option<&UserIdentifier>, entry: &CacheEntry) -> Result<(), AuthError> {
    let Some(user) = user else {
        return Ok(());
    };

    let (matches, actual) = match user.kind {
        IdentifierKind::OptionalDisplayableId => return Ok(()),
        IdentifierKind::RequiredDisplayableId => (
            entry
                .user
                .as_ref()
                .is_some_and(|u| u.matches_displayable_id(&user.id)),
            entry.displayable_id(),
        ),
        IdentifierKind::UniqueId => (entry.user_id() == Some(user.id.as_str()), entry.user_id()),
    };

    if matches {
        Ok(())
    } else {
        Err(AuthError::UserMismatch {
            expected: user.id.clone(),
            actual: actual.unwrap_or("<unknown>").to_string(),
        })
    }
}
