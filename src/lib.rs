//! OAuth2/OpenID token acquisition for native applications.
//!
//! Acquires access tokens from Azure AD or ADFS authorities, caches them in a
//! pluggable [`TokenCacheStore`], and refreshes them silently.
//!
//! ```no_run
//! use aadauth::{AuthenticationContext, TokenRequest};
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let context = AuthenticationContext::with_authority("https://login.windows.net/contoso.com")?;
//! let request = TokenRequest::new(["https://graph.microsoft.com/User.Read"], "client-id")
//!     .with_redirect_uri(Url::parse("http://localhost:28491/callback")?);
//!
//! let token = context.acquire_token(&request).await.into_result()?;
//! println!("expires {}", token.expires_on);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
#[cfg(target_os = "macos")]
pub mod keychain;

pub use auth::authority::{Authority, AuthorityValidator};
pub use auth::broker::{AuthorizationOutcome, AuthorizationRequest, InteractiveAuthBroker, SystemBrowserBroker};
pub use auth::context::{AuthenticationContext, AuthenticationContextOptions};
pub use auth::engine::TokenAcquisitionEngine;
pub use auth::request::{AssertionType, IdentifierKind, PromptBehavior, TokenRequest, UserIdentifier};
pub use auth::result::{AuthenticationResult, AuthenticationStatus, TokenPayload};
pub use auth::transport::{HttpResponse, HttpTransport, ReqwestTransport};
pub use cache::{
    CacheEntry, CacheFilter, CacheKey, FileTokenCache, MemoryTokenCache, SecureString, TokenCacheStore, UserInformation,
};
pub use error::{AuthError, CacheError};
#[cfg(target_os = "macos")]
pub use keychain::KeychainTokenCache;
