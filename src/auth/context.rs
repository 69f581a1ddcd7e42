//! Public entry point bound to one authority.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::authority::{Authority, AuthorityValidator};
use super::broker::{InteractiveAuthBroker, SystemBrowserBroker};
use super::engine::{TokenAcquisitionEngine, DEFAULT_EXPIRATION_SKEW_SECS};
use super::request::{AssertionType, TokenRequest};
use super::result::AuthenticationResult;
use super::transport::{HttpTransport, ReqwestTransport};
use crate::cache::{CacheEntry, CacheFilter, MemoryTokenCache, TokenCacheStore};
use crate::error::AuthError;

/// Construction options for [`AuthenticationContext`].
pub struct AuthenticationContextOptions {
    /// Check the authority against trusted instances before the first request.
    pub validate_authority: bool,
    /// Token store; `None` disables caching.
    pub token_cache: Option<Arc<dyn TokenCacheStore>>,
    /// Passed to brokers that return through an application URL scheme.
    pub application_url_scheme: Option<String>,
    /// Correlation id for requests that do not carry their own.
    pub correlation_id: Option<Uuid>,
    /// HTTP transport; `None` builds a [`ReqwestTransport`].
    pub transport: Option<Arc<dyn HttpTransport>>,
    /// Interactive sign-in; `None` makes interactive calls fail with
    /// [`AuthError::UserInputRequired`] once the cache is exhausted.
    pub broker: Option<Arc<dyn InteractiveAuthBroker>>,
    pub validator: AuthorityValidator,
    pub expiration_skew: Duration,
}

impl Default for AuthenticationContextOptions {
    fn default() -> Self {
        Self {
            validate_authority: true,
            token_cache: Some(MemoryTokenCache::shared()),
            application_url_scheme: None,
            correlation_id: None,
            transport: None,
            broker: Some(Arc::new(SystemBrowserBroker::new())),
            validator: AuthorityValidator::default(),
            expiration_skew: Duration::seconds(DEFAULT_EXPIRATION_SKEW_SECS),
        }
    }
}

/// Acquires tokens from one authority.
///
/// Cloning is cheap; clones share the engine, cache and transport.
#[derive(Clone)]
pub struct AuthenticationContext {
    engine: Arc<TokenAcquisitionEngine>,
    transport: Arc<dyn HttpTransport>,
    validator: AuthorityValidator,
    validate_authority: bool,
    correlation_id: Option<Uuid>,
    application_url_scheme: Option<String>,
}

impl AuthenticationContext {
    pub fn new(authority: &str, options: AuthenticationContextOptions) -> Result<Self, AuthError> {
        let authority = Authority::parse(authority)?;

        let transport: Arc<dyn HttpTransport> = match options.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let engine = TokenAcquisitionEngine::new(authority, Arc::clone(&transport))
            .with_cache(options.token_cache)
            .with_broker(options.broker)
            .with_application_url_scheme(options.application_url_scheme.clone())
            .with_expiration_skew(options.expiration_skew);

        Ok(Self {
            engine: Arc::new(engine),
            transport,
            validator: options.validator,
            validate_authority: options.validate_authority,
            correlation_id: options.correlation_id,
            application_url_scheme: options.application_url_scheme,
        })
    }

    /// Context with default options.
    pub fn with_authority(authority: &str) -> Result<Self, AuthError> {
        Self::new(authority, AuthenticationContextOptions::default())
    }

    pub fn authority(&self) -> &str {
        self.engine.authority().as_str()
    }

    pub fn validate_authority(&self) -> bool {
        self.validate_authority
    }

    pub fn set_validate_authority(&mut self, validate: bool) {
        self.validate_authority = validate;
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Correlation id for requests without their own; `None` generates one per request.
    pub fn set_correlation_id(&mut self, correlation_id: Option<Uuid>) {
        self.correlation_id = correlation_id;
    }

    pub fn application_url_scheme(&self) -> Option<&str> {
        self.application_url_scheme.as_deref()
    }

    pub fn token_cache(&self) -> Option<&Arc<dyn TokenCacheStore>> {
        self.engine.cache()
    }

    /// Acquire a token, showing sign-in UI when the cache cannot satisfy the request.
    pub async fn acquire_token(&self, request: &TokenRequest) -> AuthenticationResult {
        let correlation_id = self.correlation_id_for(request);
        let outcome = match self.ensure_authority(correlation_id).await {
            Ok(()) => self.engine.acquire_token(request, correlation_id).await,
            Err(e) => Err(e),
        };
        self.finish(outcome, correlation_id)
    }

    /// Acquire a token from the cache or with a refresh token, never showing UI.
    pub async fn acquire_token_silent(&self, request: &TokenRequest) -> AuthenticationResult {
        let correlation_id = self.correlation_id_for(request);
        let outcome = match self.ensure_authority(correlation_id).await {
            Ok(()) => self.engine.acquire_token_silent(request, correlation_id).await,
            Err(e) => Err(e),
        };
        self.finish(outcome, correlation_id)
    }

    /// Exchange a SAML or JWT user assertion for a token.
    pub async fn acquire_token_for_assertion(
        &self,
        assertion: &str,
        assertion_type: AssertionType,
        request: &TokenRequest,
    ) -> AuthenticationResult {
        let correlation_id = self.correlation_id_for(request);
        let outcome = match self.ensure_authority(correlation_id).await {
            Ok(()) => {
                self.engine
                    .acquire_token_for_assertion(assertion, assertion_type, request, correlation_id)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(outcome, correlation_id)
    }

    /// Run [`acquire_token`](Self::acquire_token) on the tokio runtime and
    /// deliver the result to `callback` exactly once.
    pub fn acquire_token_with_callback<F>(&self, request: TokenRequest, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(AuthenticationResult) + Send + 'static,
    {
        let context = self.clone();
        tokio::spawn(async move { callback(context.acquire_token(&request).await) })
    }

    pub fn acquire_token_silent_with_callback<F>(&self, request: TokenRequest, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(AuthenticationResult) + Send + 'static,
    {
        let context = self.clone();
        tokio::spawn(async move { callback(context.acquire_token_silent(&request).await) })
    }

    pub fn acquire_token_for_assertion_with_callback<F>(
        &self,
        assertion: String,
        assertion_type: AssertionType,
        request: TokenRequest,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(AuthenticationResult) + Send + 'static,
    {
        let context = self.clone();
        tokio::spawn(async move {
            callback(
                context
                    .acquire_token_for_assertion(&assertion, assertion_type, &request)
                    .await,
            )
        })
    }

    /// Remove cached entries matching the filter. Returns how many were removed.
    pub fn clear_cache(&self, filter: &CacheFilter) -> Result<usize, AuthError> {
        match self.engine.cache() {
            Some(cache) => {
                let removed = cache.remove_all_matching(filter)?;
                info!(removed, "Cleared token cache entries");
                Ok(removed)
            }
            None => Ok(0),
        }
    }

    fn correlation_id_for(&self, request: &TokenRequest) -> Uuid {
        request
            .correlation_id
            .or(self.correlation_id)
            .unwrap_or_else(Uuid::new_v4)
    }

    async fn ensure_authority(&self, correlation_id: Uuid) -> Result<(), AuthError> {
        if !self.validate_authority {
            return Ok(());
        }
        self.validator
            .validate(self.engine.authority(), &*self.transport, correlation_id)
            .await
    }

    fn finish(&self, outcome: Result<CacheEntry, AuthError>, correlation_id: Uuid) -> AuthenticationResult {
        match &outcome {
            Ok(entry) => info!(
                %correlation_id,
                expires_on = %entry.expires_on,
                "Token acquired"
            ),
            Err(e @ (AuthError::UserInputRequired | AuthError::UserCancelled)) => {
                info!(%correlation_id, reason = %e, "Token not acquired")
            }
            Err(e) => warn!(%correlation_id, error = %e, "Token acquisition failed"),
        }
        AuthenticationResult::new(outcome, correlation_id)
    }
}
