//! Interactive sign-in seam.
//!
//! The engine builds the authorization URL; a broker shows it to the user
//! and reports where the authority redirected back to.

use async_trait::async_trait;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::callback_server::{CallbackResult, CallbackServer};
use crate::error::AuthError;

/// Default time to wait for the user to finish signing in.
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Authorization request handed to a broker.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Fully built authorize URL, including state and PKCE challenge.
    pub url: Url,
    pub redirect_uri: Url,
    pub state: String,
    pub correlation_id: Uuid,
    /// URL scheme under which the application receives app-switch callbacks.
    pub application_url_scheme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// Final redirect URL carrying `code` and `state`, or `error`.
    Redirect(String),
    /// The user dismissed the sign-in UI.
    Cancelled,
}

/// Presents the authorization URL to the user.
///
/// Implementations must not parse the redirect; the engine validates `state`
/// and exchanges the code.
#[async_trait]
pub trait InteractiveAuthBroker: Send + Sync {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationOutcome, AuthError>;
}

/// Opens a URL for the user.
pub type Launcher = Arc<dyn Fn(&Url) -> std::io::Result<()> + Send + Sync>;

/// Broker that opens the system browser and listens on the loopback redirect URI.
pub struct SystemBrowserBroker {
    timeout: Duration,
    launcher: Launcher,
}

impl Default for SystemBrowserBroker {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BROKER_TIMEOUT,
            launcher: Arc::new(|url: &Url| open::that(url.as_str())),
        }
    }
}

impl SystemBrowserBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace how the URL is opened, e.g. to print it on a headless machine.
    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }
}

#[async_trait]
impl InteractiveAuthBroker for SystemBrowserBroker {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationOutcome, AuthError> {
        // Bind before launching so the redirect cannot race the listener
        let server = CallbackServer::bind(&request.redirect_uri)?;

        info!(correlation_id = %request.correlation_id, "Opening browser for sign-in");
        (self.launcher)(&request.url)
            .map_err(|e| AuthError::BrokerFailure(format!("Failed to open browser: {}", e)))?;

        // Dropping the sender (e.g. when this future is dropped) stops the listener
        let (_cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let timeout = self.timeout;

        let result = tokio::task::spawn_blocking(move || server.wait(cancel_rx, timeout))
            .await
            .map_err(|e| AuthError::BrokerFailure(format!("Callback server task failed: {}", e)))?;

        match result {
            CallbackResult::Success(url) => Ok(AuthorizationOutcome::Redirect(url)),
            CallbackResult::Cancelled => Ok(AuthorizationOutcome::Cancelled),
            CallbackResult::TimedOut => {
                warn!(correlation_id = %request.correlation_id, "Timed out waiting for sign-in");
                Err(AuthError::BrokerFailure(format!(
                    "no redirect received within {}s",
                    timeout.as_secs()
                )))
            }
            CallbackResult::Error(e) => Err(AuthError::BrokerFailure(e)),
        }
    }
}
