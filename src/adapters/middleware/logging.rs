use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue},
    response::Response,
};
use http_body_util::BodyExt;
use serde::Deserialize;

use crate::{
    core::{
        middleware::{Middleware, Next},
        rate_limiter::client_ip,
    },
    metrics,
    utils::response::bad_request,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_LOGGED_BODY: usize = 1000;
const REDACTED_HEADERS: [&str; 5] = [
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "x-auth-token",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingParams {
    pub log_headers: bool,
    pub log_body: bool,
}

/// Access log, request id propagation and request metrics.
pub struct LoggingMiddleware {
    weight: i32,
    service: String,
    params: LoggingParams,
    counter: AtomicU64,
}

impl LoggingMiddleware {
    pub fn new(weight: i32, service: impl Into<String>, params: LoggingParams) -> Self {
        Self {
            weight,
            service: service.into(),
            params,
            counter: AtomicU64::new(0),
        }
    }

    /// Extend an upstream id with this service, or mint a new one.
    fn request_id(&self, headers: &HeaderMap) -> String {
        match headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(existing) => format!("{existing}->{}", self.service),
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{}_{nanos}_{n}", self.service)
            }
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let start = Instant::now();
        let request_id = self.request_id(req.headers());
        let header_value = HeaderValue::from_str(&request_id).ok();
        if let Some(value) = &header_value {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let remote = client_ip(req.headers(), req.extensions());
        let user_agent = header_str(req.headers(), "user-agent");
        let user_id = header_str(req.headers(), "x-user-id");

        tracing::info!(
            request_id,
            %method,
            path,
            remote,
            user_agent,
            query,
            user_id,
            "Request started"
        );
        if self.params.log_headers {
            tracing::info!(request_id, headers = ?redacted(req.headers()), "Request headers");
        }
        if self.params.log_body {
            let (parts, body) = req.into_parts();
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::warn!(request_id, "Failed to read request body: {}", e);
                    return bad_request("Failed to read request body");
                }
            };
            tracing::info!(request_id, body = %truncate_body(&bytes), "Request body");
            req = Request::from_parts(parts, Body::from(bytes));
        }

        let mut response = next.run(req).await;
        if let Some(value) = header_value {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let status = response.status();
        let duration = start.elapsed();
        metrics::increment_request_total(&path, method.as_str(), status.as_u16());
        metrics::record_request_duration(&path, method.as_str(), duration);

        let duration_ms = duration.as_millis() as u64;
        if status.is_server_error() {
            tracing::error!(request_id, %method, path, status = status.as_u16(), duration_ms, "Request completed");
        } else if status.is_client_error() {
            tracing::warn!(request_id, %method, path, status = status.as_u16(), duration_ms, "Request completed");
        } else {
            tracing::info!(request_id, %method, path, status = status.as_u16(), duration_ms, "Request completed");
        }
        response
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn redacted(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if REDACTED_HEADERS.contains(&name.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

pub(crate) fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_LOGGED_BODY {
        format!(
            "{}...(truncated)",
            String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY])
        )
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_extended_or_generated() {
        let stage = LoggingMiddleware::new(20, "orders", LoggingParams::default());
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("gateway_1_1"));
        assert_eq!(stage.request_id(&headers), "gateway_1_1->orders");

        let first = stage.request_id(&HeaderMap::new());
        let second = stage.request_id(&HeaderMap::new());
        assert!(first.starts_with("orders_"));
        assert!(first.ends_with("_1"));
        assert!(second.ends_with("_2"));
    }

    #[test]
    fn test_sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        let shown = redacted(&headers);
        assert!(shown.contains(&("authorization".to_string(), "[REDACTED]".to_string())));
        assert!(shown.contains(&("x-trace".to_string(), "abc".to_string())));
    }

    #[test]
    fn test_body_is_truncated() {
        assert_eq!(truncate_body(b"short"), "short");
        let long = vec![b'a'; 1500];
        let shown = truncate_body(&long);
        assert!(shown.ends_with("...(truncated)"));
        assert_eq!(shown.len(), 1000 + "...(truncated)".len());
    }
}
