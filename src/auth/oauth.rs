//! OAuth2 protocol helpers: PKCE, authorization URLs, callback parsing and
//! token endpoint requests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::request::{AssertionType, PromptBehavior, UserIdentifier};
use super::transport::HttpTransport;
use crate::cache::{CacheEntry, SecureString, UserInformation};
use crate::error::AuthError;

/// Lifetime assumed when the server omits both `expires_in` and `expires_on`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest lifetime accepted from a token response (100 years).
const MAX_EXPIRES_IN_SECS: i64 = 100 * 365 * 24 * 3600;

/// Scopes always requested so the response carries an id token and refresh token.
const RESERVED_SCOPES: [&str; 2] = ["openid", "offline_access"];

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (stored locally, sent in token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, sent in auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let verifier = random_urlsafe(32);

        // Create challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Random state value for CSRF protection.
pub fn generate_state() -> String {
    random_urlsafe(16)
}

fn random_urlsafe(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Scope string sent on the wire: requested plus additional plus reserved scopes.
pub fn wire_scope(scopes: &BTreeSet<String>, additional: &[String]) -> String {
    let mut all: BTreeSet<&str> = scopes.iter().map(String::as_str).collect();
    all.extend(additional.iter().map(|s| s.trim()).filter(|s| !s.is_empty()));
    all.extend(RESERVED_SCOPES);
    all.into_iter().collect::<Vec<_>>().join(" ")
}

/// Everything needed to build an authorization request URL.
#[derive(Debug)]
pub struct AuthorizationParams<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a Url,
    pub scope: &'a str,
    pub state: &'a str,
    pub pkce: &'a PkceChallenge,
    pub prompt_behavior: PromptBehavior,
    pub user: Option<&'a UserIdentifier>,
    pub policy: Option<&'a str>,
    pub extra_query_parameters: Option<&'a str>,
    pub correlation_id: Uuid,
}

/// Build the URL for browser-based sign-in.
pub fn build_authorization_url(endpoint: &Url, params: &AuthorizationParams<'_>) -> Url {
    let mut url = endpoint.clone();

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", params.client_id)
            .append_pair("redirect_uri", params.redirect_uri.as_str())
            .append_pair("scope", params.scope)
            .append_pair("state", params.state)
            .append_pair("code_challenge", &params.pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("client-request-id", &params.correlation_id.to_string());

        if let Some(prompt) = params.prompt_behavior.prompt_parameter() {
            query.append_pair("prompt", prompt);
        }
        if let Some(hint) = params.user.and_then(UserIdentifier::login_hint) {
            query.append_pair("login_hint", hint);
        }
        if let Some(policy) = params.policy {
            query.append_pair("p", policy);
        }
    }

    if let Some(extra) = params
        .extra_query_parameters
        .map(|e| e.trim().trim_start_matches(['?', '&']))
        .filter(|e| !e.is_empty())
    {
        let query = format!("{}&{}", url.query().unwrap_or_default(), extra);
        url.set_query(Some(&query));
    }

    url
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<(String, String), AuthError> {
    let url = Url::parse(url_string).map_err(|_| AuthError::InvalidAuthCode)?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    // Check for error response
    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|s| s.to_string())
            .unwrap_or_else(|| error.to_string());
        return Err(AuthError::AuthorizationFailed {
            error: error.to_string(),
            description,
        });
    }

    let code = params
        .get("code")
        .filter(|c| !c.is_empty())
        .ok_or(AuthError::InvalidAuthCode)?
        .to_string();

    let state = params
        .get("state")
        .ok_or(AuthError::StateMismatch)?
        .to_string();

    Ok((code, state))
}

/// Token response from the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds; some endpoints send it as a string.
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_in: Option<u64>,
    /// Absolute expiry as a unix timestamp.
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_on: Option<u64>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Family of client ids sharing the refresh token.
    #[serde(default)]
    pub foci: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn number_or_string<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(d)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// `now + secs`, capped at the longest accepted lifetime and saturating at the
/// end of the representable range.
fn expiry_after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(secs.min(MAX_EXPIRES_IN_SECS))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Error body returned by the token endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_codes: Vec<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry of the access token.
    ///
    /// Lifetimes beyond [`MAX_EXPIRES_IN_SECS`] are capped.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let latest = expiry_after(now, MAX_EXPIRES_IN_SECS);
        if let Some(secs) = self.expires_in {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            return expiry_after(now, secs);
        }
        if let Some(at) = self
            .expires_on
            .and_then(|s| i64::try_from(s).ok())
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
        {
            return at.min(latest);
        }
        debug!("Token response carries no expiry, assuming default lifetime");
        expiry_after(now, DEFAULT_EXPIRES_IN_SECS)
    }

    fn user(&self) -> Option<UserInformation> {
        let id_token = self.id_token.as_deref()?;
        match UserInformation::from_id_token(id_token) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Ignoring unparsable id_token");
                None
            }
        }
    }

    /// Build a fresh cache entry from this response.
    pub fn into_entry(
        self,
        authority: &str,
        client_id: &str,
        scopes: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> CacheEntry {
        let expires_on = self.expires_at(now);
        let user = self.user();

        CacheEntry {
            access_token: SecureString::new(self.access_token),
            access_token_type: self.token_type,
            refresh_token: self.refresh_token.filter(|rt| !rt.is_empty()).map(SecureString::new),
            expires_on,
            scopes: scopes.clone(),
            user,
            family_id: self.foci,
            authority: authority.to_string(),
            client_id: client_id.to_string(),
        }
    }

    /// Apply a refresh response to an existing entry.
    ///
    /// A returned refresh token replaces the stored one; when the server does not
    /// rotate, the old refresh token stays valid and is kept.
    pub fn merge_into(self, entry: &mut CacheEntry, now: DateTime<Utc>) {
        entry.expires_on = self.expires_at(now);
        if let Some(user) = self.user() {
            entry.user = Some(user);
        }
        entry.access_token = SecureString::new(self.access_token);
        entry.access_token_type = self.token_type;
        if let Some(rt) = self.refresh_token.filter(|rt| !rt.is_empty()) {
            entry.refresh_token = Some(SecureString::new(rt));
        }
        if self.foci.is_some() {
            entry.family_id = self.foci;
        }
    }
}

/// Grant presented to the token endpoint.
#[derive(Debug)]
pub enum TokenGrant<'a> {
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a Url,
        code_verifier: &'a str,
    },
    RefreshToken {
        refresh_token: &'a str,
    },
    Assertion {
        assertion: &'a str,
        assertion_type: AssertionType,
    },
}

impl TokenGrant<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
            Self::Assertion { .. } => "assertion",
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        match self {
            Self::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
            } => vec![
                ("grant_type".into(), "authorization_code".into()),
                ("code".into(), code.to_string()),
                ("redirect_uri".into(), redirect_uri.to_string()),
                ("code_verifier".into(), code_verifier.to_string()),
            ],
            Self::RefreshToken { refresh_token } => vec![
                ("grant_type".into(), "refresh_token".into()),
                ("refresh_token".into(), refresh_token.to_string()),
            ],
            Self::Assertion {
                assertion,
                assertion_type,
            } => {
                let mut params = vec![
                    ("grant_type".into(), assertion_type.grant_type().into()),
                    ("assertion".into(), assertion_type.encode_assertion(assertion)),
                ];
                if *assertion_type == AssertionType::JwtBearer {
                    params.push(("requested_token_use".into(), "on_behalf_of".into()));
                }
                params
            }
        }
    }
}

/// OAuth2 token endpoint client bound to one client id and correlation id.
pub struct OAuth2Client {
    transport: Arc<dyn HttpTransport>,
    token_endpoint: Url,
    client_id: String,
    policy: Option<String>,
    correlation_id: Uuid,
}

impl OAuth2Client {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        token_endpoint: Url,
        client_id: &str,
        policy: Option<&str>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            transport,
            token_endpoint,
            client_id: client_id.to_string(),
            policy: policy.map(str::to_string),
            correlation_id,
        }
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &Url,
        pkce_verifier: &str,
        scope: &str,
    ) -> Result<TokenResponse, AuthError> {
        let grant = TokenGrant::AuthorizationCode {
            code,
            redirect_uri,
            code_verifier: pkce_verifier,
        };
        self.request_token(grant, scope).await
    }

    /// Refresh an access token using a refresh token.
    pub async fn refresh_token(&self, refresh_token: &str, scope: &str) -> Result<TokenResponse, AuthError> {
        self.request_token(TokenGrant::RefreshToken { refresh_token }, scope)
            .await
    }

    /// Exchange a user assertion for tokens.
    pub async fn exchange_assertion(
        &self,
        assertion: &str,
        assertion_type: AssertionType,
        scope: &str,
    ) -> Result<TokenResponse, AuthError> {
        let grant = TokenGrant::Assertion {
            assertion,
            assertion_type,
        };
        self.request_token(grant, scope).await
    }

    async fn request_token(&self, grant: TokenGrant<'_>, scope: &str) -> Result<TokenResponse, AuthError> {
        let mut params = grant.params();
        params.push(("client_id".into(), self.client_id.clone()));
        params.push(("scope".into(), scope.to_string()));
        if let Some(policy) = &self.policy {
            params.push(("p".into(), policy.clone()));
        }

        let response = self
            .transport
            .post_form(&self.token_endpoint, &params, self.correlation_id)
            .await?;

        if !response.is_success() {
            let error = map_error_response(response.status, &response.body);
            // Log error details for debugging (error bodies carry no tokens)
            warn!(
                grant = grant.name(),
                status = response.status,
                correlation_id = %self.correlation_id,
                error = %error,
                "Token request failed"
            );
            return Err(error);
        }

        serde_json::from_str::<TokenResponse>(&response.body)
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse token response: {}", e)))
    }
}

/// Map a failed token endpoint response to an error.
pub fn map_error_response(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => AuthError::InvalidGrant {
            description: err.error_description.unwrap_or(err.error),
        },
        Ok(err) => AuthError::ServerError {
            description: err.error_description.unwrap_or_default(),
            error: err.error,
            status,
        },
        Err(_) => AuthError::ServerError {
            error: "http_error".into(),
            description: format!("HTTP {}", status),
            status,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::transport::HttpResponse;
    use crate::cache::entry::tests::{make_entry, make_id_token};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceChallenge::new();

        // Verifier should be base64url encoded (43 chars for 32 bytes)
        assert_eq!(pkce.verifier.len(), 43);
        assert!(!pkce.challenge.is_empty());

        // Challenge should be different from verifier
        assert_ne!(pkce.verifier, pkce.challenge);

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn test_wire_scope_adds_reserved_scopes() {
        let scopes: BTreeSet<String> = ["resource.read".to_string()].into_iter().collect();
        let scope = wire_scope(&scopes, &["mail.send".to_string(), " ".to_string()]);
        assert_eq!(scope, "mail.send offline_access openid resource.read");
    }

    #[test]
    fn test_authorization_url() {
        let endpoint = Url::parse("https://login.windows.net/contoso.com/oauth2/authorize").unwrap();
        let redirect = Url::parse("http://localhost:28491/callback").unwrap();
        let pkce = PkceChallenge::new();
        let user = UserIdentifier::optional_displayable_id("jane@contoso.com");

        let url = build_authorization_url(
            &endpoint,
            &AuthorizationParams {
                client_id: "abc",
                redirect_uri: &redirect,
                scope: "openid resource.read",
                state: "xyz",
                pkce: &pkce,
                prompt_behavior: PromptBehavior::Always,
                user: Some(&user),
                policy: Some("B2C_1_signin"),
                extra_query_parameters: Some("&domain_hint=contoso.com"),
                correlation_id: Uuid::nil(),
            },
        );

        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "abc");
        assert_eq!(params["redirect_uri"], "http://localhost:28491/callback");
        assert_eq!(params["state"], "xyz");
        assert_eq!(params["code_challenge"], pkce.challenge);
        assert_eq!(params["prompt"], "login");
        assert_eq!(params["login_hint"], "jane@contoso.com");
        assert_eq!(params["p"], "B2C_1_signin");
        assert_eq!(params["domain_hint"], "contoso.com");
        assert!(url.query().unwrap().ends_with("&domain_hint=contoso.com"));
    }

    #[test]
    fn test_parse_callback_success() {
        let url = "http://localhost:28491/callback?code=abc123&state=xyz789";
        let (code, state) = parse_callback_url(url).unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz789");
    }

    #[test]
    fn test_parse_callback_error() {
        let url = "http://localhost:28491/callback?error=access_denied&error_description=User%20declined";
        let result = parse_callback_url(url);
        assert!(matches!(
            result,
            Err(AuthError::AuthorizationFailed { ref error, ref description })
                if error == "access_denied" && description == "User declined"
        ));
    }

    #[test]
    fn test_parse_callback_missing_code() {
        let url = "http://localhost:28491/callback?state=xyz789";
        let result = parse_callback_url(url);
        assert!(matches!(result, Err(AuthError::InvalidAuthCode)));
    }

    #[test]
    fn test_token_response_string_expiry() {
        let json = r#"{"access_token":"AT","token_type":"Bearer","expires_in":"3599","refresh_token":"RT"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.expires_in, Some(3599));

        let now = Utc::now();
        assert_eq!(response.expires_at(now), now + Duration::seconds(3599));
    }

    #[test]
    fn test_huge_expiry_is_capped() {
        let now = Utc::now();
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"AT","expires_in":"10000000000000"}"#).unwrap();
        let expires = response.expires_at(now);
        assert_eq!(expires, now + Duration::seconds(MAX_EXPIRES_IN_SECS));

        let response: TokenResponse =
            serde_json::from_value(serde_json::json!({"access_token": "AT", "expires_in": u64::MAX})).unwrap();
        assert_eq!(response.expires_at(now), now + Duration::seconds(MAX_EXPIRES_IN_SECS));

        let response: TokenResponse =
            serde_json::from_value(serde_json::json!({"access_token": "AT", "expires_on": 200_000_000_000u64}))
                .unwrap();
        assert_eq!(response.expires_at(now), now + Duration::seconds(MAX_EXPIRES_IN_SECS));

        let entry = response.into_entry("https://login.windows.net/contoso.com", "abc", &BTreeSet::new(), now);
        assert!(!entry.is_expired(now, Duration::minutes(5)));
        let json = serde_json::to_string(&entry).unwrap();
        let restored: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.expires_on, entry.expires_on);
    }

    #[test]
    fn test_expiry_saturates_at_end_of_time() {
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(expiry_after(near_end, 3600 * 48), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry_after(near_end, 60), near_end + Duration::seconds(60));
    }

    #[test]
    fn test_token_response_into_entry() {
        let id_token = make_id_token(serde_json::json!({"oid": "u1", "upn": "jane@contoso.com"}));
        let json = serde_json::json!({
            "access_token": "AT",
            "expires_on": 2_000_000_000u64,
            "refresh_token": "RT",
            "id_token": id_token,
            "foci": "1"
        });
        let response: TokenResponse = serde_json::from_value(json).unwrap();
        let scopes: BTreeSet<String> = ["a".to_string()].into_iter().collect();

        let entry = response.into_entry("https://login.windows.net/contoso.com", "abc", &scopes, Utc::now());
        assert_eq!(entry.access_token.as_str(), "AT");
        assert_eq!(entry.access_token_type, "Bearer");
        assert_eq!(entry.expires_on.timestamp(), 2_000_000_000);
        assert_eq!(entry.user_id(), Some("u1"));
        assert_eq!(entry.family_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_merge_keeps_refresh_token_without_rotation() {
        let mut entry = make_entry(-60, Some("old-rt"));
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"new-at","expires_in":3600}"#).unwrap();

        response.merge_into(&mut entry, Utc::now());
        assert_eq!(entry.access_token.as_str(), "new-at");
        assert_eq!(entry.refresh_token.as_ref().unwrap().as_str(), "old-rt");
        assert!(!entry.is_expired(Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn test_map_error_response() {
        let err = map_error_response(400, r#"{"error":"invalid_grant","error_description":"AADSTS70008: expired"}"#);
        assert!(matches!(err, AuthError::InvalidGrant { ref description } if description.contains("AADSTS70008")));

        let err = map_error_response(401, r#"{"error":"invalid_client","error_description":"bad"}"#);
        assert!(matches!(err, AuthError::ServerError { ref error, status: 401, .. } if error == "invalid_client"));

        let err = map_error_response(502, "<html>bad gateway</html>");
        assert!(matches!(err, AuthError::ServerError { status: 502, .. }));
    }

    struct RecordingTransport {
        params: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn post_form(
            &self,
            _url: &Url,
            params: &[(String, String)],
            _correlation_id: Uuid,
        ) -> Result<HttpResponse, AuthError> {
            *self.params.lock() = params.to_vec();
            Ok(HttpResponse {
                status: 200,
                body: r#"{"access_token":"AT","expires_in":60}"#.into(),
            })
        }

        async fn get(&self, _url: &Url, _correlation_id: Uuid) -> Result<HttpResponse, AuthError> {
            unreachable!("token client never issues GET")
        }
    }

    #[tokio::test]
    async fn test_assertion_grant_params() {
        let transport = Arc::new(RecordingTransport {
            params: Mutex::new(Vec::new()),
        });
        let client = OAuth2Client::new(
            transport.clone(),
            Url::parse("https://login.windows.net/contoso.com/oauth2/token").unwrap(),
            "abc",
            Some("B2C_1_signin"),
            Uuid::new_v4(),
        );

        client
            .exchange_assertion("jwt.assertion.sig", AssertionType::JwtBearer, "openid api")
            .await
            .unwrap();

        let params: HashMap<_, _> = transport.params.lock().iter().cloned().collect();
        assert_eq!(params["grant_type"], "urn:ietf:params:oauth:grant-type:jwt-bearer");
        assert_eq!(params["assertion"], "jwt.assertion.sig");
        assert_eq!(params["requested_token_use"], "on_behalf_of");
        assert_eq!(params["client_id"], "abc");
        assert_eq!(params["scope"], "openid api");
        assert_eq!(params["p"], "B2C_1_signin");
    }
}
