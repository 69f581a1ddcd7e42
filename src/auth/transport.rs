//! HTTP transport used for token and discovery requests.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::AuthError;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the correlation id to the service.
pub const CORRELATION_HEADER: &str = "client-request-id";

/// Raw HTTP response handed back to the token client.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Narrow HTTP capability the engine depends on.
///
/// Implementations report connection-level failures as
/// [`AuthError::NetworkFailure`]; any HTTP status, including errors, is a
/// successful transport result.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST an `application/x-www-form-urlencoded` body.
    async fn post_form(
        &self,
        url: &Url,
        params: &[(String, String)],
        correlation_id: Uuid,
    ) -> Result<HttpResponse, AuthError>;

    /// GET a JSON document.
    async fn get(&self, url: &Url, correlation_id: Uuid) -> Result<HttpResponse, AuthError>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::NetworkFailure(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Wrap an existing client, e.g. one configured with a proxy.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse, AuthError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::NetworkFailure(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_form(
        &self,
        url: &Url,
        params: &[(String, String)],
        correlation_id: Uuid,
    ) -> Result<HttpResponse, AuthError> {
        debug!(%url, %correlation_id, "POST token request");

        let response = self
            .http_client
            .post(url.clone())
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .header("return-client-request-id", "true")
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::NetworkFailure(e.to_string()))?;

        Self::read(response).await
    }

    async fn get(&self, url: &Url, correlation_id: Uuid) -> Result<HttpResponse, AuthError> {
        debug!(%url, %correlation_id, "GET request");

        let response = self
            .http_client
            .get(url.clone())
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .header("return-client-request-id", "true")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| AuthError::NetworkFailure(e.to_string()))?;

        Self::read(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_form_sends_correlation_id() {
        let server = MockServer::start().await;
        let correlation_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/contoso.com/oauth2/token"))
            .and(header(CORRELATION_HEADER, correlation_id.to_string().as_str()))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"AT"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let url = Url::parse(&format!("{}/contoso.com/oauth2/token", server.uri())).unwrap();
        let params = vec![("grant_type".to_string(), "refresh_token".to_string())];

        let response = transport.post_form(&url, &params, correlation_id).await.unwrap();
        assert!(response.is_success());
        assert!(response.body.contains("AT"));
    }

    #[tokio::test]
    async fn test_error_status_is_not_transport_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/common/discovery/instance"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_instance"}"#))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let url = Url::parse(&format!("{}/common/discovery/instance", server.uri())).unwrap();

        let response = transport.get(&url, Uuid::new_v4()).await.unwrap();
        assert_eq!(response.status, 400);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let transport = ReqwestTransport::new().unwrap();
        // Nothing listens on port 9 (discard) locally
        let url = Url::parse("http://127.0.0.1:9/oauth2/token").unwrap();

        let result = transport.get(&url, Uuid::new_v4()).await;
        assert!(matches!(result, Err(AuthError::NetworkFailure(_))));
    }
}
