//! aadauth - acquire Azure AD / ADFS access tokens from the terminal.

#![deny(clippy::all)]

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

use aadauth::config::Config;
use aadauth::{
    AssertionType, AuthenticationContext, AuthenticationResult, CacheFilter, PromptBehavior, TokenRequest,
    UserIdentifier,
};

#[derive(Parser)]
#[command(name = "aadauth", version, about = "Acquire Azure AD and ADFS access tokens")]
struct Cli {
    /// Authority URL, e.g. https://login.microsoftonline.com/contoso.com
    #[arg(long, global = true)]
    authority: Option<String>,

    /// Application (client) id
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Scope to request; repeat for several. Defaults to the configured scopes.
    #[arg(long = "scope", global = true)]
    scopes: Vec<String>,

    /// Correlation id sent with every request
    #[arg(long, global = true)]
    correlation_id: Option<Uuid>,

    /// Skip authority validation
    #[arg(long, global = true)]
    no_validate: bool,

    /// Print the access token
    #[arg(long, global = true)]
    show_token: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in, using the browser when the cache cannot satisfy the request
    Login {
        #[arg(long, value_enum, default_value_t = Prompt::Auto)]
        prompt: Prompt,

        /// Sign-in name to prefill
        #[arg(long)]
        login_hint: Option<String>,

        /// Require the token to be issued for this sign-in name
        #[arg(long, conflicts_with = "login_hint")]
        require_user: Option<String>,

        /// Raw query string appended to the authorization request
        #[arg(long)]
        extra_query: Option<String>,

        /// Policy passed through to the authority
        #[arg(long)]
        policy: Option<String>,
    },

    /// Get a token from the cache or with a refresh token, never prompting
    Silent {
        /// Sign-in name selecting one of several cached accounts
        #[arg(long)]
        user: Option<String>,
    },

    /// Exchange a user assertion read from a file
    Assertion {
        #[arg(long)]
        file: PathBuf,

        #[arg(long = "type", value_enum, default_value_t = AssertionKind::Jwt)]
        kind: AssertionKind,
    },

    /// Remove cached tokens for the configured client
    Clear {
        /// Remove tokens for every client and authority
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Prompt {
    Auto,
    Always,
    RefreshSession,
    ForcePrompt,
}

impl From<Prompt> for PromptBehavior {
    fn from(prompt: Prompt) -> Self {
        match prompt {
            Prompt::Auto => Self::Auto,
            Prompt::Always => Self::Always,
            Prompt::RefreshSession => Self::RefreshSession,
            Prompt::ForcePrompt => Self::ForcePrompt,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AssertionKind {
    Saml1,
    Saml2,
    Jwt,
}

impl From<AssertionKind> for AssertionType {
    fn from(kind: AssertionKind) -> Self {
        match kind {
            AssertionKind::Saml1 => Self::Saml1_1,
            AssertionKind::Saml2 => Self::Saml2,
            AssertionKind::Jwt => Self::JwtBearer,
        }
    }
}

fn main() {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        // .env file is optional - only log if it's not a "file not found" error
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config.logging.level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether a token was acquired.
async fn run(cli: Cli, mut config: Config) -> Result<bool> {
    if let Some(authority) = &cli.authority {
        config.authority.url = authority.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.oauth.client_id = client_id.clone();
    }
    if cli.no_validate {
        config.authority.validate = false;
    }
    config.validate()?;

    info!("Starting {} v{}", config.app.name, config.app.version);

    let mut options = config.context_options()?;
    options.correlation_id = cli.correlation_id;
    let context = AuthenticationContext::new(&config.authority.url, options)
        .with_context(|| format!("Invalid authority {}", config.authority.url))?;

    let scopes = if cli.scopes.is_empty() {
        config.oauth.scopes.clone()
    } else {
        cli.scopes.clone()
    };
    let request = TokenRequest::new(scopes, config.oauth.client_id.clone());

    let result = match cli.command {
        Command::Login {
            prompt,
            login_hint,
            require_user,
            extra_query,
            policy,
        } => {
            let redirect_uri = Url::parse(&config.oauth.redirect_uri)
                .with_context(|| format!("Invalid redirect URI {}", config.oauth.redirect_uri))?;
            let mut request = request
                .with_redirect_uri(redirect_uri)
                .with_prompt_behavior(prompt.into());
            if let Some(hint) = login_hint {
                request = request.with_user(UserIdentifier::optional_displayable_id(hint));
            }
            if let Some(user) = require_user {
                request = request.with_user(UserIdentifier::required_displayable_id(user));
            }
            if let Some(extra) = extra_query {
                request = request.with_extra_query_parameters(extra);
            }
            if let Some(policy) = policy {
                request = request.with_policy(policy);
            }

            println!("Signing in to {} ...", context.authority());
            context.acquire_token(&request).await
        }
        Command::Silent { user } => {
            let request = match user {
                Some(user) => request.with_user(UserIdentifier::optional_displayable_id(user)),
                None => request,
            };
            context.acquire_token_silent(&request).await
        }
        Command::Assertion { file, kind } => {
            let assertion = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read assertion from {}", file.display()))?;
            context
                .acquire_token_for_assertion(assertion.trim(), kind.into(), &request)
                .await
        }
        Command::Clear { all } => {
            let filter = if all {
                CacheFilter::new()
            } else {
                CacheFilter::new()
                    .authority(context.authority())
                    .client_id(&config.oauth.client_id)
            };
            let removed = context.clear_cache(&filter)?;
            println!("Removed {} cached token{}", removed, if removed == 1 { "" } else { "s" });
            return Ok(true);
        }
    };

    Ok(print_result(&result, cli.show_token))
}

fn print_result(result: &AuthenticationResult, show_token: bool) -> bool {
    match result.token() {
        Some(token) => {
            let remaining = token.expires_on - Utc::now();
            println!("Status:     {:?}", result.status());
            if let Some(user) = token.user.as_ref().and_then(|u| u.displayable_id.as_deref()) {
                println!("User:       {}", user);
            }
            println!(
                "Expires:    {} (in {})",
                token.expires_on.format("%Y-%m-%d %H:%M:%S UTC"),
                format_duration(remaining)
            );
            println!(
                "Scopes:     {}",
                token.scopes.iter().cloned().collect::<Vec<_>>().join(" ")
            );
            println!("Request id: {}", result.correlation_id);
            if show_token {
                println!("{}", token.authorization_header());
            }
            true
        }
        None => {
            if let Some(e) = result.error() {
                eprintln!("{}", e.user_message());
                eprintln!("  {}", e);
                if e.requires_interaction() {
                    eprintln!("  Run `aadauth login` to sign in.");
                }
            }
            eprintln!("Request id: {}", result.correlation_id);
            false
        }
    }
}

/// Format a duration for display.
fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}

/// `level` is `logging.level` from config.toml, already overridden by `RUST_LOG`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("Warning: Invalid log filter {:?}: {}", level, e);
        EnvFilter::new("info")
    });

    // Logs go to stderr so token output on stdout stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(30)), "< 1 min");
        assert_eq!(format_duration(Duration::minutes(5)), "5 min");
        assert_eq!(format_duration(Duration::minutes(60)), "1 hour");
        assert_eq!(format_duration(Duration::minutes(120)), "2 hours");
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "aadauth",
            "login",
            "--prompt",
            "refresh-session",
            "--scope",
            "a",
            "--scope",
            "b",
            "--show-token",
        ])
        .unwrap();

        assert_eq!(cli.scopes, vec!["a", "b"]);
        assert!(cli.show_token);
        match cli.command {
            Command::Login { prompt, .. } => {
                assert_eq!(PromptBehavior::from(prompt), PromptBehavior::RefreshSession)
            }
            _ => panic!("expected login"),
        }

        assert!(Cli::try_parse_from(["aadauth", "login", "--login-hint", "a", "--require-user", "b"]).is_err());
    }
}
