use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{Method, StatusCode},
    response::Response,
};
use serde::Deserialize;

use crate::{
    adapters::auth_providers::AuthProviderManager,
    core::middleware::{Middleware, Next},
    ports::auth::AuthError,
    utils::response::json_error,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthParams {
    pub provider: String,
}

impl Default for AuthParams {
    fn default() -> Self {
        Self {
            provider: "token".to_string(),
        }
    }
}

/// Rejects requests the configured provider does not accept.
pub struct AuthMiddleware {
    weight: i32,
    provider: String,
    providers: Arc<AuthProviderManager>,
}

impl AuthMiddleware {
    pub fn new(weight: i32, params: AuthParams, providers: Arc<AuthProviderManager>) -> Self {
        Self {
            weight,
            provider: params.provider,
            providers,
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, mut req: Request, next: Next) -> Response {
        if req.method() == Method::OPTIONS {
            return next.run(req).await;
        }

        let provider = match self.providers.get(&self.provider) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!(provider = %self.provider, "Auth provider unavailable: {}", e);
                return json_error(
                    StatusCode::UNAUTHORIZED,
                    "Unauthorized",
                    "Authentication provider unavailable",
                );
            }
        };

        match provider.authenticate(req.headers()).await {
            Ok(user) => {
                tracing::debug!(user_id = %user.id, provider = %user.provider, "Request authenticated");
                req.extensions_mut().insert(user);
                next.run(req).await
            }
            Err(AuthError::Challenge(response)) => *response,
            Err(e) => {
                tracing::warn!(path = %req.uri().path(), provider = %self.provider, "Authentication failed: {}", e);
                json_error(StatusCode::UNAUTHORIZED, "Unauthorized", e.to_string())
            }
        }
    }
}
