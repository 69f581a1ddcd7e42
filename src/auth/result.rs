//! Outcome of an acquire-token operation.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::cache::{CacheEntry, SecureString, UserInformation};
use crate::error::AuthError;

/// Coarse status of an [`AuthenticationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationStatus {
    Succeeded,
    /// A silent call needed interaction.
    UserInputRequired,
    UserCancelled,
    Failed,
}

/// Token handed back to the caller on success.
#[derive(Debug, Clone)]
pub struct TokenPayload {
    pub access_token: SecureString,
    pub access_token_type: String,
    pub expires_on: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    pub user: Option<UserInformation>,
}

impl From<CacheEntry> for TokenPayload {
    fn from(entry: CacheEntry) -> Self {
        Self {
            access_token: entry.access_token,
            access_token_type: entry.access_token_type,
            expires_on: entry.expires_on,
            scopes: entry.scopes,
            user: entry.user,
        }
    }
}

impl TokenPayload {
    /// `Authorization` header value.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.access_token_type, self.access_token.as_str())
    }
}

/// Result delivered for every acquire-token call, success or failure.
#[derive(Debug)]
pub struct AuthenticationResult {
    pub outcome: Result<TokenPayload, AuthError>,
    /// Correlation id sent with every request made for this call.
    pub correlation_id: Uuid,
}

impl AuthenticationResult {
    pub fn new(outcome: Result<CacheEntry, AuthError>, correlation_id: Uuid) -> Self {
        Self {
            outcome: outcome.map(TokenPayload::from),
            correlation_id,
        }
    }

    pub fn status(&self) -> AuthenticationStatus {
        match &self.outcome {
            Ok(_) => AuthenticationStatus::Succeeded,
            Err(AuthError::UserInputRequired) => AuthenticationStatus::UserInputRequired,
            Err(AuthError::UserCancelled) => AuthenticationStatus::UserCancelled,
            Err(_) => AuthenticationStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn token(&self) -> Option<&TokenPayload> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&AuthError> {
        self.outcome.as_ref().err()
    }

    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.token().map(|t| t.expires_on)
    }

    pub fn into_result(self) -> Result<TokenPayload, AuthError> {
        self.outcome
    }
}
