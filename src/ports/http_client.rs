use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::core::errors::{RuntimeError, RuntimeResult};

/// Per-call overrides for an outbound request.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Extra headers sent with every attempt
    pub headers: HashMap<String, String>,
    /// Overrides the service's retry count
    pub retries: Option<u32>,
    /// Overrides the service's per-attempt timeout
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A response that made it back from a peer.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> RuntimeResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RuntimeError::ClientResponseInvalid(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a 4xx or 5xx answer into `ClientRequestFailed`, keeping the peer's
    /// `error`/`message` envelope fields when the body carries them.
    pub fn error_for_status(self) -> RuntimeResult<Self> {
        let status = self.status.as_u16();
        if status < 400 {
            return Ok(self);
        }
        let message = serde_json::from_slice::<HashMap<String, serde_json::Value>>(&self.body)
            .ok()
            .and_then(|envelope| {
                let field = |key: &str| {
                    envelope
                        .get(key)
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                };
                match (field("error"), field("message")) {
                    (Some(error), Some(message)) => Some(format!("{error}: {message}")),
                    (Some(text), None) | (None, Some(text)) => Some(text),
                    (None, None) => None,
                }
            })
            .unwrap_or_else(|| format!("HTTP {status}"));
        Err(RuntimeError::ClientRequestFailed {
            message,
            status: Some(status),
            source: None,
        })
    }
}

/// Outbound HTTP seam used by the event dispatcher.
///
/// Implemented by the client manager; the dispatcher only needs to know who
/// subscribes to an action and how to reach them.
#[async_trait]
pub trait OutboundClient: Send + Sync + 'static {
    /// Names of the configured services whose `events` include `action`.
    fn subscribers(&self, action: &str) -> Vec<String>;

    /// Call a configured service through its circuit breaker and retry loop.
    async fn call_service(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: CallOptions,
    ) -> RuntimeResult<ClientResponse>;

    /// POST raw bytes to an absolute URL, bypassing the per-service machinery.
    async fn post_absolute(
        &self,
        url: &str,
        body: Bytes,
        headers: HeaderMap,
        timeout: Duration,
    ) -> RuntimeResult<ClientResponse>;
}
