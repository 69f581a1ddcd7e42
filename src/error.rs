//! Error types for the aadauth library.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

/// Errors surfaced by token acquisition.
///
/// Every acquire-token operation reports failures through this type inside an
/// [`AuthenticationResult`](crate::AuthenticationResult); nothing is raised as a panic.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid authority: {0}")]
    InvalidAuthority(String),

    #[error("Authority could not be validated: {0}")]
    AuthorityNotValidated(String),

    #[error("User interaction is required to acquire a token")]
    UserInputRequired,

    #[error("User cancelled authentication")]
    UserCancelled,

    #[error("Multiple users found in the token cache; specify a user identifier")]
    MultipleUsersFound,

    #[error("Token was returned for user {actual}, but {expected} was required")]
    UserMismatch { expected: String, actual: String },

    #[error("Grant rejected by the server: {description}")]
    InvalidGrant { description: String },

    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Server error ({error}): {description}")]
    ServerError {
        error: String,
        description: String,
        status: u16,
    },

    #[error("Authorization failed ({error}): {description}")]
    AuthorizationFailed { error: String, description: String },

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid authorization code")]
    InvalidAuthCode,

    #[error("State validation failed (possible CSRF attack)")]
    StateMismatch,

    #[error("Interactive authorization failed: {0}")]
    BrokerFailure(String),

    #[error("Token cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Token cache storage errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to store cache entry: {0}")]
    StoreFailed(String),

    #[error("Failed to read cache entry: {0}")]
    RetrieveFailed(String),

    #[error("Failed to delete cache entry: {0}")]
    DeleteFailed(String),

    #[error("Failed to serialize cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// Returns a user-friendly message for display in the UI.
    pub fn user_message(&self) -> &str {
        match self {
            Self::InvalidAuthority(_) | Self::AuthorityNotValidated(_) => {
                "The sign-in authority is not trusted. Check the configuration."
            }
            Self::UserInputRequired => "Please sign in again.",
            Self::UserCancelled => "Sign-in was cancelled.",
            Self::MultipleUsersFound => "More than one account is signed in. Pick an account.",
            Self::UserMismatch { .. } => "Signed in with a different account than requested.",
            Self::InvalidGrant { .. } => "Session expired. Please sign in again.",
            Self::NetworkFailure(_) => "Network error. Check your connection.",
            Self::StateMismatch => "Security error. Please try signing in again.",
            Self::Cache(_) => "Failed to access saved credentials.",
            _ => "An error occurred. Please try again.",
        }
    }

    /// Returns true if retrying with interactive sign-in may resolve this error.
    pub fn requires_interaction(&self) -> bool {
        matches!(
            self,
            Self::UserInputRequired | Self::InvalidGrant { .. } | Self::MultipleUsersFound
        )
    }

    /// OAuth2 error code carried by server-originated errors.
    pub fn protocol_code(&self) -> Option<&str> {
        match self {
            Self::InvalidGrant { .. } => Some("invalid_grant"),
            Self::ServerError { error, .. } | Self::AuthorizationFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}
