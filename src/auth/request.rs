//! Acquire-token request parameters.

use base64::{engine::general_purpose::STANDARD, Engine};
use url::Url;
use uuid::Uuid;

/// Controls whether and how interactive sign-in UI is shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptBehavior {
    /// Prompt only when the cache and refresh token cannot satisfy the request.
    #[default]
    Auto,
    /// Always prompt for credentials, bypassing the cache.
    Always,
    /// Re-authorize through the UI so the token carries updated claims.
    /// Sent as `prompt=refresh_session`.
    RefreshSession,
    /// Force a prompt even where a broker could sign in silently.
    ForcePrompt,
}

impl PromptBehavior {
    /// Whether this behavior skips the cache and goes straight to the UI.
    pub fn bypasses_cache(self) -> bool {
        !matches!(self, Self::Auto)
    }

    /// Value of the `prompt` authorization parameter.
    pub fn prompt_parameter(self) -> Option<&'static str> {
        match self {
            Self::Auto => None,
            Self::Always | Self::ForcePrompt => Some("login"),
            Self::RefreshSession => Some("refresh_session"),
        }
    }
}

/// How a [`UserIdentifier`] constrains cache lookups and issued tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Stable object id; becomes part of the cache key.
    UniqueId,
    /// Sign-in name used as a hint only; mismatches are tolerated.
    OptionalDisplayableId,
    /// Sign-in name that cached and newly issued tokens must match.
    RequiredDisplayableId,
}

/// Selects one account among several cached users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentifier {
    pub id: String,
    pub kind: IdentifierKind,
}

impl UserIdentifier {
    pub fn unique_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentifierKind::UniqueId,
        }
    }

    pub fn optional_displayable_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentifierKind::OptionalDisplayableId,
        }
    }

    pub fn required_displayable_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentifierKind::RequiredDisplayableId,
        }
    }

    /// Value for the `login_hint` authorization parameter.
    pub fn login_hint(&self) -> Option<&str> {
        match self.kind {
            IdentifierKind::UniqueId => None,
            _ => Some(&self.id),
        }
    }
}

/// Type of a user assertion exchanged in the assertion flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssertionType {
    /// SAML 1.1 assertion.
    #[default]
    Saml1_1,
    /// SAML 2.0 assertion.
    Saml2,
    /// JWT for the on-behalf-of flow.
    JwtBearer,
}

impl AssertionType {
    pub fn grant_type(self) -> &'static str {
        match self {
            Self::Saml1_1 => "urn:ietf:params:oauth:grant-type:saml1_1-bearer",
            Self::Saml2 => "urn:ietf:params:oauth:grant-type:saml2-bearer",
            Self::JwtBearer => "urn:ietf:params:oauth:grant-type:jwt-bearer",
        }
    }

    /// Encode the assertion the way the token endpoint expects it.
    pub fn encode_assertion(self, assertion: &str) -> String {
        match self {
            Self::Saml1_1 | Self::Saml2 => STANDARD.encode(assertion.as_bytes()),
            Self::JwtBearer => assertion.to_string(),
        }
    }
}

/// Parameters shared by every acquire-token operation.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    /// Scopes the token must be issued for; these form the cache key.
    pub scopes: Vec<String>,
    /// Extra scopes to ask consent for, not part of the cache key.
    pub additional_scopes: Vec<String>,
    pub client_id: String,
    /// Required for the interactive flow.
    pub redirect_uri: Option<Url>,
    pub user: Option<UserIdentifier>,
    pub prompt_behavior: PromptBehavior,
    /// Raw query string appended to the authorization request.
    pub extra_query_parameters: Option<String>,
    /// Opaque policy selector passed through to the service as `p`.
    pub policy: Option<String>,
    /// Overrides the context's correlation id for this request.
    pub correlation_id: Option<Uuid>,
}

impl TokenRequest {
    pub fn new<I, S>(scopes: I, client_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            additional_scopes: Vec::new(),
            client_id: client_id.into(),
            redirect_uri: None,
            user: None,
            prompt_behavior: PromptBehavior::Auto,
            extra_query_parameters: None,
            policy: None,
            correlation_id: None,
        }
    }

    pub fn with_additional_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: Url) -> Self {
        self.redirect_uri = Some(redirect_uri);
        self
    }

    pub fn with_user(mut self, user: UserIdentifier) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_prompt_behavior(mut self, prompt_behavior: PromptBehavior) -> Self {
        self.prompt_behavior = prompt_behavior;
        self
    }

    pub fn with_extra_query_parameters(mut self, params: impl Into<String>) -> Self {
        self.extra_query_parameters = Some(params.into());
        self
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
