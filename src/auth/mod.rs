//! Token acquisition against Azure AD and ADFS authorities.
//!
//! [`context::AuthenticationContext`] is the entry point. It validates the
//! authority and hands requests to [`engine::TokenAcquisitionEngine`], which
//! drives the OAuth2 authorization-code (PKCE), refresh-token and assertion
//! flows over a pluggable [`transport::HttpTransport`] and
//! [`broker::InteractiveAuthBroker`].

pub mod authority;
pub mod broker;
pub mod callback_server;
pub mod context;
pub mod engine;
pub mod oauth;
pub mod request;
pub mod result;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
