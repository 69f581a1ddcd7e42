//! Stub transport and broker shared by the flow tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::broker::{AuthorizationOutcome, AuthorizationRequest, InteractiveAuthBroker};
use super::transport::{HttpResponse, HttpTransport};
use crate::cache::entry::tests::make_id_token;
use crate::error::AuthError;

pub(crate) const REDIRECT: &str = "http://localhost:28491/callback";

/// A form post seen by [`StubTransport`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedPost {
    pub url: Url,
    pub params: HashMap<String, String>,
    pub correlation_id: Uuid,
}

/// Transport returning queued responses and recording every form posted.
#[derive(Default)]
pub(crate) struct StubTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    discovery: Mutex<Option<HttpResponse>>,
    posts: Mutex<Vec<RecordedPost>>,
    gets: Mutex<Vec<Url>>,
}

impl StubTransport {
    pub(crate) fn with(responses: impl IntoIterator<Item = (u16, String)>) -> Arc<Self> {
        let stub = Self::default();
        stub.responses.lock().extend(
            responses
                .into_iter()
                .map(|(status, body)| HttpResponse { status, body }),
        );
        Arc::new(stub)
    }

    /// Answer every GET with this response.
    pub(crate) fn set_discovery(&self, status: u16, body: &str) {
        *self.discovery.lock() = Some(HttpResponse {
            status,
            body: body.to_string(),
        });
    }

    pub(crate) fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub(crate) fn get_count(&self) -> usize {
        self.gets.lock().len()
    }

    pub(crate) fn last_post(&self) -> RecordedPost {
        self.posts.lock().last().cloned().expect("no form was posted")
    }
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn post_form(
        &self,
        url: &Url,
        params: &[(String, String)],
        correlation_id: Uuid,
    ) -> Result<HttpResponse, AuthError> {
        self.posts.lock().push(RecordedPost {
            url: url.clone(),
            params: params.iter().cloned().collect(),
            correlation_id,
        });
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| AuthError::NetworkFailure("no stubbed response".into()))
    }

    async fn get(&self, url: &Url, _correlation_id: Uuid) -> Result<HttpResponse, AuthError> {
        self.gets.lock().push(url.clone());
        self.discovery
            .lock()
            .clone()
            .ok_or_else(|| AuthError::NetworkFailure("unexpected GET".into()))
    }
}

pub(crate) enum BrokerReply {
    Code(&'static str),
    WrongState,
    Cancel,
}

/// Broker that answers like a browser redirect would.
pub(crate) struct StubBroker {
    reply: BrokerReply,
    pub requests: Mutex<Vec<Url>>,
}

impl StubBroker {
    pub(crate) fn new(reply: BrokerReply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn last_params(&self) -> HashMap<String, String> {
        self.requests
            .lock()
            .last()
            .map(|url| url.query_pairs().into_owned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InteractiveAuthBroker for StubBroker {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationOutcome, AuthError> {
        self.requests.lock().push(request.url.clone());
        Ok(match self.reply {
            BrokerReply::Code(code) => {
                AuthorizationOutcome::Redirect(format!("{}?code={}&state={}", REDIRECT, code, request.state))
            }
            BrokerReply::WrongState => AuthorizationOutcome::Redirect(format!("{}?code=XYZ&state=forged", REDIRECT)),
            BrokerReply::Cancel => AuthorizationOutcome::Cancelled,
        })
    }
}

/// Successful token endpoint body, optionally with an id token for `(oid, upn)`.
pub(crate) fn token_body(access_token: &str, refresh_token: Option<&str>, user: Option<(&str, &str)>) -> (u16, String) {
    let mut body = serde_json::json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if let Some(rt) = refresh_token {
        body["refresh_token"] = rt.into();
    }
    if let Some((oid, upn)) = user {
        body["id_token"] = make_id_token(serde_json::json!({"oid": oid, "upn": upn})).into();
    }
    (200, body.to_string())
}

pub(crate) fn invalid_grant() -> (u16, String) {
    (
        400,
        r#"{"error":"invalid_grant","error_description":"AADSTS70008: refresh token expired"}"#.into(),
    )
}
