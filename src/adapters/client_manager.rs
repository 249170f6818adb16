//! Registry of per-service outbound clients.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, Method},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        auth_providers::AuthProviderManager,
        http_client::{ServiceClient, ServiceClientSettings, send},
    },
    config::models::ClientsConfig,
    core::{
        circuit_breaker::{BreakerStats, CircuitBreaker},
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    metrics,
    ports::{
        component::Component,
        http_client::{CallOptions, ClientResponse, OutboundClient},
    },
};

pub struct ClientManager {
    config: ClientsConfig,
    http: reqwest::Client,
    clients: HashMap<String, Arc<ServiceClient>>,
    subscriptions: HashMap<String, Vec<String>>,
    state: StateCell,
}

impl ClientManager {
    /// Build one client per configured service. Outgoing credentials are
    /// resolved here so a missing provider fails at boot.
    pub fn new(
        config: ClientsConfig,
        auth: Option<&AuthProviderManager>,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| RuntimeError::wrap("failed to build HTTP client", e))?;

        let mut clients = HashMap::new();
        let mut subscriptions: HashMap<String, Vec<String>> = HashMap::new();
        for (name, service) in &config.services {
            let settings = ServiceClientSettings::resolve(&config, service);
            let breaker_config = service
                .circuit_breaker
                .as_ref()
                .unwrap_or(&config.circuit_breaker);
            let breaker = Arc::new(CircuitBreaker::new(name.clone(), breaker_config));

            let mut default_headers = HeaderMap::new();
            if let Some(service_auth) = &service.auth {
                let provider = auth
                    .ok_or_else(|| {
                        RuntimeError::ConfigInvalid(format!(
                            "service {name} requires auth but no providers are configured"
                        ))
                    })?
                    .get(&service_auth.provider)
                    .map_err(|e| RuntimeError::ConfigInvalid(format!("service {name}: {e}")))?;
                provider
                    .apply_to_outgoing(&mut default_headers, &service_auth.payload)
                    .map_err(|e| RuntimeError::ConfigInvalid(format!("service {name}: {e}")))?;
            }

            for event in &service.events {
                subscriptions
                    .entry(event.clone())
                    .or_default()
                    .push(name.clone());
            }

            tracing::info!(service = %name, base_url = %settings.base_url, "HTTP client created");
            let client = ServiceClient::new(
                name.clone(),
                http.clone(),
                settings,
                breaker,
                cancel.clone(),
            )
            .with_default_headers(default_headers);
            clients.insert(name.clone(), Arc::new(client));
        }
        for subscribers in subscriptions.values_mut() {
            subscribers.sort();
        }

        Ok(Self {
            config,
            http,
            clients,
            subscriptions,
            state: StateCell::new(),
        })
    }

    pub fn get_client(&self, service: &str) -> RuntimeResult<Arc<ServiceClient>> {
        self.clients
            .get(service)
            .cloned()
            .ok_or_else(|| RuntimeError::ClientNotFound(service.to_string()))
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn breaker_stats(&self, service: &str) -> RuntimeResult<BreakerStats> {
        Ok(self.get_client(service)?.breaker_stats())
    }

    /// Call `service` and record client metrics.
    pub async fn call(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: &CallOptions,
    ) -> RuntimeResult<ClientResponse> {
        if !self.state.is_running() {
            return Err(RuntimeError::NotInitialized);
        }
        let client = self.get_client(service)?;
        let _timer = metrics::ClientRequestTimer::new(service, method.as_str());
        let result = client.call(method.clone(), path, body, options).await;

        let status = match &result {
            Ok(response) => response.status.as_u16().to_string(),
            Err(_) => "error".to_string(),
        };
        metrics::increment_client_request(service, method.as_str(), &status);
        metrics::set_breaker_state(service, client.breaker().state().as_str());
        if let Err(e) = &result {
            tracing::warn!(service, %method, path, "Outbound call failed: {}", e);
        }
        result
    }

    async fn check_services(&self) {
        for (name, client) in &self.clients {
            if let Err(e) = client.check_health().await {
                tracing::warn!(
                    service = %name,
                    "Service health check failed during initialization: {}",
                    e
                );
            }
        }
    }
}

#[async_trait]
impl OutboundClient for ClientManager {
    fn subscribers(&self, action: &str) -> Vec<String> {
        self.subscriptions.get(action).cloned().unwrap_or_default()
    }

    async fn call_service(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> RuntimeResult<ClientResponse> {
        self.call(service, method, path, body.as_ref(), &options).await
    }

    async fn post_absolute(
        &self,
        url: &str,
        body: Bytes,
        headers: HeaderMap,
        timeout: Duration,
    ) -> RuntimeResult<ClientResponse> {
        let request = self.http.post(url).headers(headers).body(body).timeout(timeout);
        send(request).await.map_err(|(_, e)| e)
    }
}

#[async_trait]
impl Component for ClientManager {
    fn name(&self) -> &'static str {
        "clients"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        for client in self.clients.values() {
            client.open();
        }
        if self.config.health_probe {
            self.check_services().await;
        }
        for (name, client) in &self.clients {
            metrics::set_breaker_state(name, client.breaker().state().as_str());
        }
        self.state.set(LifecycleState::Running);
        tracing::info!(services = ?self.services(), "Client manager started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        for client in self.clients.values() {
            client.close();
        }
        self.state.set(LifecycleState::Stopped);
        tracing::info!(clients_closed = self.clients.len(), "Client manager stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::get};

    use super::*;
    use crate::config::models::{ServiceAuthConfig, ServiceClientConfig};

    fn service(url: &str, events: &[&str]) -> ServiceClientConfig {
        ServiceClientConfig {
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscribers_and_lookup() {
        let config = ClientsConfig {
            enabled: true,
            services: HashMap::from([
                ("billing".to_string(), service("http://127.0.0.1:1", &["created", "deleted"])),
                ("audit".to_string(), service("http://127.0.0.1:2", &["created"])),
            ]),
            ..Default::default()
        };
        let manager = ClientManager::new(config, None, &CancellationToken::new()).unwrap();
        assert_eq!(manager.subscribers("created"), vec!["audit", "billing"]);
        assert_eq!(manager.subscribers("deleted"), vec!["billing"]);
        assert!(manager.subscribers("shipped").is_empty());
        assert!(matches!(
            manager.get_client("missing"),
            Err(RuntimeError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_outgoing_auth_is_attached() {
        let app = axum::Router::new().route(
            "/whoami",
            get(|headers: HeaderMap| async move {
                headers
                    .get("token")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("anonymous")
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let auth = AuthProviderManager::new();
        auth.register(
            "token",
            Arc::new(crate::adapters::auth_providers::TokenAuthProvider::new("in")),
        )
        .unwrap();
        let mut users = service(&format!("http://{addr}"), &[]);
        users.auth = Some(ServiceAuthConfig {
            provider: "token".to_string(),
            payload: HashMap::from([("token".to_string(), "out-token".to_string())]),
        });
        let config = ClientsConfig {
            enabled: true,
            services: HashMap::from([("users".to_string(), users)]),
            ..Default::default()
        };
        let manager = ClientManager::new(config, Some(&auth), &CancellationToken::new()).unwrap();

        assert!(matches!(
            manager
                .call("users", Method::GET, "/whoami", None, &CallOptions::default())
                .await,
            Err(RuntimeError::NotInitialized)
        ));
        manager.start().await.unwrap();
        let response = manager
            .call("users", Method::GET, "/whoami", None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "out-token");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_restores_calls() {
        let app = axum::Router::new().route("/ok", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = ClientsConfig {
            enabled: true,
            services: HashMap::from([("svc".to_string(), service(&format!("http://{addr}"), &[]))]),
            ..Default::default()
        };
        let manager = ClientManager::new(config, None, &CancellationToken::new()).unwrap();
        manager.start().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.get_client("svc").unwrap().is_running());

        manager.start().await.unwrap();
        let client = manager.get_client("svc").unwrap();
        assert!(client.is_running());
        assert_eq!(client.breaker().state(), crate::core::circuit_breaker::BreakerState::Closed);
        let response = manager
            .call("svc", Method::GET, "/ok", None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "ok");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_auth_provider_fails_construction() {
        let mut users = service("http://127.0.0.1:1", &[]);
        users.auth = Some(ServiceAuthConfig {
            provider: "oauth".to_string(),
            payload: HashMap::new(),
        });
        let config = ClientsConfig {
            services: HashMap::from([("users".to_string(), users)]),
            ..Default::default()
        };
        assert!(ClientManager::new(config, Some(&AuthProviderManager::new()), &CancellationToken::new()).is_err());
    }
}
