//! Built-in authentication providers and their registry.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::json;

use crate::{
    config::models::AuthProvidersConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::{
        auth::{AuthError, AuthProvider, AuthenticatedUser},
        component::Component,
    },
};

pub const DEFAULT_REALM: &str = "Protected Area";

/// Shared static token, read from `Token` or `Authorization`.
pub struct TokenAuthProvider {
    token: String,
}

impl TokenAuthProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn extract(headers: &HeaderMap) -> Option<&str> {
        if let Some(token) = header_str(headers, "token").filter(|t| !t.is_empty()) {
            return Some(token);
        }
        let authorization = header_str(headers, header::AUTHORIZATION.as_str())?;
        Some(
            authorization
                .strip_prefix("Bearer ")
                .or_else(|| authorization.strip_prefix("Token "))
                .unwrap_or(authorization),
        )
    }
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    fn provider_type(&self) -> &'static str {
        "token"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError> {
        match Self::extract(headers) {
            Some(token) if !self.token.is_empty() && token == self.token => Ok(AuthenticatedUser {
                id: "token".to_string(),
                provider: self.provider_type().to_string(),
            }),
            _ => Err(AuthError::InvalidCredentials("Invalid token".to_string())),
        }
    }

    fn apply_to_outgoing(
        &self,
        headers: &mut HeaderMap,
        payload: &HashMap<String, String>,
    ) -> Result<(), AuthError> {
        let token = payload
            .get("token")
            .ok_or_else(|| AuthError::PayloadInvalid("token not found in auth payload".to_string()))?;
        let value = HeaderValue::from_str(token)
            .map_err(|e| AuthError::PayloadInvalid(format!("token is not a valid header: {e}")))?;
        headers.insert("token", value);
        Ok(())
    }
}

/// HTTP Basic credentials with a `WWW-Authenticate` challenge on failure.
pub struct BasicAuthProvider {
    username: String,
    password: String,
    realm: String,
}

impl BasicAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: DEFAULT_REALM.to_string(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn challenge(&self, message: &str) -> AuthError {
        let body = json!({
            "error": "Authentication Required",
            "message": message,
            "realm": self.realm,
            "type": "basic_auth_challenge",
        });
        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", self.realm)) {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        AuthError::Challenge(Box::new(response))
    }
}

#[async_trait]
impl AuthProvider for BasicAuthProvider {
    fn provider_type(&self) -> &'static str {
        "basic"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError> {
        let Some(authorization) = header_str(headers, header::AUTHORIZATION.as_str()) else {
            return Err(self.challenge("Authorization header required"));
        };
        let Some(encoded) = authorization.strip_prefix("Basic ") else {
            return Err(self.challenge("Basic authentication required"));
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return Err(self.challenge("Invalid authentication encoding"));
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return Err(self.challenge("Invalid authentication encoding"));
        };
        let Some((username, password)) = credentials.split_once(':') else {
            return Err(self.challenge("Invalid authentication format"));
        };
        if username != self.username || password != self.password {
            return Err(self.challenge("Invalid username or password"));
        }
        Ok(AuthenticatedUser {
            id: username.to_string(),
            provider: self.provider_type().to_string(),
        })
    }

    fn apply_to_outgoing(
        &self,
        headers: &mut HeaderMap,
        payload: &HashMap<String, String>,
    ) -> Result<(), AuthError> {
        let (Some(username), Some(password)) = (payload.get("username"), payload.get("password"))
        else {
            return Err(AuthError::PayloadInvalid(
                "username and password not found in auth payload".to_string(),
            ));
        };
        let credentials = STANDARD.encode(format!("{username}:{password}"));
        let value = HeaderValue::from_str(&format!("Basic {credentials}"))
            .map_err(|e| AuthError::PayloadInvalid(e.to_string()))?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Providers by name. Registration closes once the manager starts.
pub struct AuthProviderManager {
    providers: RwLock<HashMap<String, Arc<dyn AuthProvider>>>,
    state: StateCell,
}

impl Default for AuthProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProviderManager {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            state: StateCell::new(),
        }
    }

    /// Register the providers whose parameters are present in `config`.
    pub fn from_config(config: &AuthProvidersConfig) -> RuntimeResult<Self> {
        let manager = Self::new();
        if let Some(token) = config.token.as_ref().and_then(|c| c.params.get("token")) {
            manager.register("token", Arc::new(TokenAuthProvider::new(token.clone())))?;
        }
        if let Some(basic) = &config.basic
            && let (Some(username), Some(password)) =
                (basic.params.get("username"), basic.params.get("password"))
        {
            let realm = basic
                .params
                .get("realm")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REALM.to_string());
            manager.register(
                "basic",
                Arc::new(BasicAuthProvider::new(username.clone(), password.clone()).with_realm(realm)),
            )?;
        }
        if manager.names().is_empty() {
            tracing::debug!("No auth providers configured");
        }
        Ok(manager)
    }

    pub fn register(&self, name: &str, provider: Arc<dyn AuthProvider>) -> RuntimeResult<()> {
        if self.state.get() != LifecycleState::Stopped {
            return Err(RuntimeError::AlreadyRunning);
        }
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(name) {
            return Err(RuntimeError::ConfigInvalid(format!(
                "auth provider {name} already registered"
            )));
        }
        providers.insert(name.to_string(), provider);
        tracing::debug!(provider = name, "Auth provider registered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AuthProvider>, AuthError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Component for AuthProviderManager {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Running)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        tracing::info!(providers = ?self.names(), "Auth provider manager started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}
