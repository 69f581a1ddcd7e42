//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::authority::AuthorityValidator;
use crate::auth::broker::SystemBrowserBroker;
use crate::auth::callback_server::DEFAULT_REDIRECT_URI;
use crate::auth::context::AuthenticationContextOptions;
use crate::cache::{FileTokenCache, MemoryTokenCache, TokenCacheStore};

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub authority: AuthorityConfig,
    pub oauth: OAuthConfig,
    pub token: TokenConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    #[serde(default = "default_browser_timeout")]
    pub browser_timeout_seconds: u64,
}

/// Which token store the CLI uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    File,
    Keychain,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_skew")]
    pub expiration_skew_seconds: i64,
    pub cache: CacheKind,
    /// Overrides the default cache file location.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}

fn default_browser_timeout() -> u64 {
    300
}

fn default_skew() -> i64 {
    300
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config = Self::from_env()?;

        // Validate required fields
        config.validate()?;

        Ok(config)
    }

    /// Parse the embedded config and apply environment overrides without validating.
    pub fn from_env() -> Result<Self> {
        // Parse embedded config
        let mut config: Config =
            toml::from_str(CONFIG_TOML).context("Failed to parse embedded config.toml")?;

        // Apply environment variable overrides
        if let Ok(authority) = env::var("AZURE_AUTHORITY") {
            config.authority.url = authority;
        }

        if let Ok(client_id) = env::var("AZURE_CLIENT_ID") {
            config.oauth.client_id = client_id;
        }

        if let Ok(redirect_uri) = env::var("AZURE_REDIRECT_URI") {
            config.oauth.redirect_uri = redirect_uri;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() || self.oauth.client_id == "YOUR_AZURE_AD_CLIENT_ID" {
            anyhow::bail!(
                "Azure AD client_id not configured. Set AZURE_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.authority.url.is_empty() || self.authority.url.contains("YOUR_TENANT_ID") {
            anyhow::bail!(
                "Authority not configured. Set AZURE_AUTHORITY environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.scopes.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("At least one scope must be configured in config.toml");
        }

        Ok(())
    }

    /// Build the token store selected by `token.cache`.
    pub fn token_cache(&self) -> Result<Option<Arc<dyn TokenCacheStore>>> {
        let cache: Arc<dyn TokenCacheStore> = match self.token.cache {
            CacheKind::None => return Ok(None),
            CacheKind::Memory => MemoryTokenCache::shared(),
            CacheKind::File => match &self.token.cache_path {
                Some(path) => Arc::new(FileTokenCache::new(path)),
                None => Arc::new(FileTokenCache::default_location().context("Failed to locate token cache file")?),
            },
            #[cfg(target_os = "macos")]
            CacheKind::Keychain => Arc::new(crate::keychain::KeychainTokenCache::new()),
            #[cfg(not(target_os = "macos"))]
            CacheKind::Keychain => anyhow::bail!("The keychain token cache is only available on macOS"),
        };
        Ok(Some(cache))
    }

    /// Map the configuration onto context options.
    pub fn context_options(&self) -> Result<AuthenticationContextOptions> {
        let validator = AuthorityValidator::new()
            .with_trusted_hosts(&self.authority.trusted_hosts)
            .with_discovery(self.authority.discovery);

        let broker = SystemBrowserBroker::new().with_timeout(Duration::from_secs(self.oauth.browser_timeout_seconds));

        Ok(AuthenticationContextOptions {
            validate_authority: self.authority.validate,
            token_cache: self.token_cache()?,
            broker: Some(Arc::new(broker)),
            validator,
            expiration_skew: chrono::Duration::seconds(self.token.expiration_skew_seconds),
            ..Default::default()
        })
    }
}
