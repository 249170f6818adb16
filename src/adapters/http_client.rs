use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::{ClientsConfig, ServiceClientConfig},
    core::{
        circuit_breaker::{BreakerStats, CircuitBreaker},
        classify::{
            CallOutcome, TransportFailure, is_breaker_failure, is_retryable, is_successful,
        },
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::http_client::{CallOptions, ClientResponse},
};

/// Resolved settings of one peer service.
#[derive(Debug, Clone)]
pub struct ServiceClientSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl ServiceClientSettings {
    /// Merge a service entry over the client defaults.
    pub fn resolve(defaults: &ClientsConfig, service: &ServiceClientConfig) -> Self {
        Self {
            base_url: service.url.trim_end_matches('/').to_string(),
            timeout: service.timeout.unwrap_or(defaults.default_timeout),
            retries: service.retries.unwrap_or(defaults.default_retries),
            retry_backoff: defaults.retry_backoff,
        }
    }
}

/// Retrying HTTP caller for one peer service, guarded by its circuit breaker.
///
/// Every attempt is classified once into a [`CallOutcome`]; the retry loop and
/// the breaker each read that outcome through their own predicate.
pub struct ServiceClient {
    name: String,
    http: reqwest::Client,
    settings: ServiceClientSettings,
    breaker: Arc<CircuitBreaker>,
    default_headers: HeaderMap,
    parent: CancellationToken,
    cancel: Mutex<CancellationToken>,
    state: StateCell,
}

impl ServiceClient {
    pub fn new(
        name: impl Into<String>,
        http: reqwest::Client,
        settings: ServiceClientSettings,
        breaker: Arc<CircuitBreaker>,
        parent: CancellationToken,
    ) -> Self {
        let state = StateCell::new();
        state.set(LifecycleState::Running);
        Self {
            name: name.into(),
            http,
            settings,
            breaker,
            default_headers: HeaderMap::new(),
            cancel: Mutex::new(parent.child_token()),
            parent,
            state,
        }
    }

    /// Headers attached to every call, e.g. outgoing credentials.
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Stop accepting calls and abort in-flight backoffs. Idempotent.
    pub fn close(&self) {
        if self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            self.cancel_token().cancel();
            self.breaker.stop();
            self.state.set(LifecycleState::Stopped);
            tracing::debug!(service = %self.name, "HTTP client closed");
        }
    }

    /// Reopen a closed client with a fresh token and a closed breaker. No-op
    /// while open.
    pub fn open(&self) {
        if self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = self.parent.child_token();
            self.breaker.restart();
            self.state.set(LifecycleState::Running);
            tracing::debug!(service = %self.name, "HTTP client reopened");
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `{base_url}{path}`, retrying transient failures.
    ///
    /// Attempts are `0..=retries`. A 2xx or a 4xx other than 408/429 is an
    /// answer and returns at once; [`ClientResponse::error_for_status`] turns
    /// the 4xx into an error. Everything else is retried after
    /// `(attempt + 1) * retry_backoff`.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: &CallOptions,
    ) -> RuntimeResult<ClientResponse> {
        let url = format!("{}{}", self.settings.base_url, path);
        let retries = options.retries.unwrap_or(self.settings.retries);
        let timeout = options.timeout.unwrap_or(self.settings.timeout);
        let headers = self.request_headers(options);
        let encoded = match body {
            Some(value) => Some(
                serde_json::to_vec(value)
                    .map_err(|e| RuntimeError::wrap("failed to encode request body", e))?,
            ),
            None => None,
        };

        let cancel = self.cancel_token();
        let mut last_error: Option<RuntimeError> = None;
        for attempt in 0..=retries {
            if !self.is_running() {
                return Err(RuntimeError::NotInitialized);
            }
            if !self.breaker.can_execute() {
                return Err(RuntimeError::CircuitOpen(self.name.clone()));
            }

            let mut request = self
                .http
                .request(method.clone(), &url)
                .headers(headers.clone())
                .timeout(timeout);
            if let Some(bytes) = &encoded {
                request = request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }

            let (outcome, result) = match send(request).await {
                Ok(response) => (CallOutcome::Status(response.status.as_u16()), Ok(response)),
                Err((failure, err)) => (CallOutcome::Transport(failure), Err(err)),
            };

            if is_successful(outcome) {
                self.breaker.record_success();
                return result;
            }
            if is_breaker_failure(outcome) {
                self.breaker.record_failure();
            }

            let error = match result {
                Ok(response) => RuntimeError::ClientRequestFailed {
                    message: format!("HTTP {}", response.status.as_u16()),
                    status: Some(response.status.as_u16()),
                    source: None,
                },
                Err(err) => err,
            };

            if matches!(outcome, CallOutcome::Transport(_)) && !is_retryable(outcome) {
                return Err(error);
            }
            last_error = Some(error);

            if attempt < retries {
                let backoff = self.settings.retry_backoff * (attempt + 1);
                tracing::debug!(
                    service = %self.name,
                    attempt,
                    backoff = ?backoff,
                    "Retrying request: {}",
                    last_error.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        return Err(RuntimeError::Canceled);
                    }
                }
            }
        }

        Err(RuntimeError::ClientRequestFailed {
            message: format!(
                "all {} attempts failed for service {}",
                retries + 1,
                self.name
            ),
            status: last_error.as_ref().and_then(RuntimeError::status),
            source: last_error.map(|e| Box::new(e) as _),
        })
    }

    /// `GET {base_url}/health` once, outside the breaker.
    pub async fn check_health(&self) -> RuntimeResult<()> {
        let request = self
            .http
            .get(format!("{}/health", self.settings.base_url))
            .timeout(Duration::from_secs(5));
        let response = send(request).await.map_err(|(_, e)| e)?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(RuntimeError::HealthCheckFailed(format!(
                "status: {}",
                response.status.as_u16()
            )))
        }
    }

    fn request_headers(&self, options: &CallOptions) -> HeaderMap {
        let mut headers = self.default_headers.clone();
        for (name, value) in &options.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            } else {
                tracing::warn!(service = %self.name, header = %name, "Skipping invalid header");
            }
        }
        headers
    }
}

/// Send one request and read the whole body.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
) -> Result<ClientResponse, (TransportFailure, RuntimeError)> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(transport_error)?;
    Ok(ClientResponse {
        status,
        headers,
        body,
    })
}

fn transport_error(err: reqwest::Error) -> (TransportFailure, RuntimeError) {
    let failure = classify_reqwest(&err);
    let message = match failure {
        TransportFailure::Timeout => "request timed out",
        TransportFailure::Connect => "connection failed",
        TransportFailure::Interrupted => "request interrupted",
        TransportFailure::Invalid => "request invalid",
        TransportFailure::Body => "response body unreadable",
        TransportFailure::Other => "request failed",
    };
    (
        failure,
        RuntimeError::ClientRequestFailed {
            message: message.to_string(),
            status: None,
            source: Some(Box::new(err)),
        },
    )
}

pub(crate) fn classify_reqwest(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::Timeout
    } else if err.is_connect() {
        TransportFailure::Connect
    } else if err.is_builder() {
        TransportFailure::Invalid
    } else if err.is_body() || err.is_decode() {
        TransportFailure::Body
    } else if err.is_request() {
        TransportFailure::Interrupted
    } else {
        TransportFailure::Other
    }
}
