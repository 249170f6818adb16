use std::collections::HashMap;

use async_trait::async_trait;
use axum::{http::HeaderMap, response::Response};
use thiserror::Error;

/// Authentication failures raised by providers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    /// Credentials are absent or wrong.
    #[error("{0}")]
    InvalidCredentials(String),

    /// The provider answers the request itself (e.g. a `WWW-Authenticate` challenge).
    #[error("authentication challenge issued")]
    Challenge(Box<Response>),

    /// The outgoing auth payload lacks a required key.
    #[error("auth payload invalid: {0}")]
    PayloadInvalid(String),

    #[error("auth provider not found: {0}")]
    ProviderNotFound(String),
}

/// Identity attached to a request once a provider accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub provider: String,
}

/// Authentication seam used inbound by the auth stage and outbound by the
/// client manager.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Provider type name, matched against `params.provider` and service auth configs.
    fn provider_type(&self) -> &'static str;

    /// Validate the credentials of an inbound request.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError>;

    /// Attach credentials described by a service's auth `payload` to an outgoing request.
    fn apply_to_outgoing(
        &self,
        headers: &mut HeaderMap,
        payload: &HashMap<String, String>,
    ) -> Result<(), AuthError>;
}
