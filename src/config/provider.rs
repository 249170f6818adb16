//! Read access to the loaded configuration.
//!
//! The provider holds the typed [`ServiceConfig`] next to the raw tree it was
//! parsed from, so components can read their own sections by dotted path
//! (`clients.services.users.url`, `middlewares.cors.params.allowed_origins.0`).
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    config::{
        loader::LoadedConfig, models::ServiceConfig, validation::ServiceConfigValidator,
    },
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::{component::Component, config_source::ConfigSource},
};

pub struct ConfigProvider {
    config: Arc<ServiceConfig>,
    raw: Value,
    origin: String,
    state: StateCell,
}

impl ConfigProvider {
    /// Load, validate and freeze the configuration of `source`.
    pub async fn from_source(source: &dyn ConfigSource) -> RuntimeResult<Self> {
        let origin = source.describe();
        let loaded = source.load_config().await.map_err(|report| {
            match report.downcast::<RuntimeError>() {
                Ok(err) => err,
                Err(report) => {
                    RuntimeError::wrap(format!("failed to load configuration from {origin}"), report)
                }
            }
        })?;
        Self::from_loaded(loaded, origin)
    }

    /// Validate an already built model.
    pub fn from_config(config: ServiceConfig) -> RuntimeResult<Self> {
        let raw = serde_json::to_value(&config)
            .map_err(|e| RuntimeError::wrap("failed to serialize configuration", e))?;
        Self::from_loaded(LoadedConfig { config, raw }, "inline".to_string())
    }

    fn from_loaded(loaded: LoadedConfig, origin: String) -> RuntimeResult<Self> {
        ServiceConfigValidator::validate(&loaded.config)
            .map_err(|e| RuntimeError::ConfigInvalid(e.to_string()))?;
        Ok(Self {
            config: Arc::new(loaded.config),
            raw: loaded.raw,
            origin,
            state: StateCell::new(),
        })
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        self.config.clone()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Value at `path`, or `default` when the path does not resolve.
    pub fn get(&self, path: &str, default: Value) -> Value {
        navigate(&self.raw, path).cloned().unwrap_or(default)
    }

    /// Decode the value at `path` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> RuntimeResult<T> {
        let value = navigate(&self.raw, path)
            .ok_or_else(|| RuntimeError::ConfigPathInvalid(path.to_string()))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RuntimeError::ConfigPathInvalid(format!("{path}: {e}")))
    }

    /// Every object key path in the tree, intermediate nodes included, sorted.
    pub fn all_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths("", &self.raw, &mut paths);
        paths.sort();
        paths
    }
}

fn navigate<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn collect_paths(prefix: &str, node: &Value, out: &mut Vec<String>) {
    if let Value::Object(map) = node {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            collect_paths(&path, value, out);
            out.push(path);
        }
    }
}

#[async_trait]
impl Component for ConfigProvider {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Running)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        tracing::debug!("Configuration provider started ({})", self.origin);
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::models::ServiceClientConfig;

    fn provider() -> ConfigProvider {
        let mut config = ServiceConfig::named("orders", "1.0.0");
        config.clients.services.insert(
            "users".to_string(),
            ServiceClientConfig {
                url: "http://users:8080".to_string(),
                events: vec!["user.created".to_string(), "user.deleted".to_string()],
                ..Default::default()
            },
        );
        ConfigProvider::from_config(config).unwrap()
    }

    #[test]
    fn test_get_with_default() {
        let provider = provider();
        assert_eq!(
            provider.get("clients.services.users.url", Value::Null),
            json!("http://users:8080")
        );
        assert_eq!(provider.get("nope.missing", json!(42)), json!(42));
    }

    #[test]
    fn test_get_indexes_arrays() {
        let provider = provider();
        assert_eq!(
            provider.get("clients.services.users.events.1", Value::Null),
            json!("user.deleted")
        );
        assert_eq!(
            provider.get("clients.services.users.events.7", Value::Null),
            Value::Null
        );
    }

    #[test]
    fn test_get_as_typed_and_missing() {
        let provider = provider();
        let port: u16 = provider.get_as("server.http.port").unwrap();
        assert_eq!(port, 8080);
        let err = provider.get_as::<String>("server.http.nothing").unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigPathInvalid(_)));
    }

    #[test]
    fn test_all_paths_includes_intermediate_nodes() {
        let paths = provider().all_paths();
        assert!(paths.contains(&"server".to_string()));
        assert!(paths.contains(&"server.http".to_string()));
        assert!(paths.contains(&"server.http.port".to_string()));
        assert!(paths.contains(&"clients.services.users.url".to_string()));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = ConfigProvider::from_config(ServiceConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_is_nominal() {
        let provider = provider();
        provider.start().await.unwrap();
        assert!(matches!(
            provider.start().await,
            Err(RuntimeError::AlreadyRunning)
        ));
        provider.stop().await.unwrap();
        assert!(matches!(provider.stop().await, Err(RuntimeError::NotRunning)));
    }
}
