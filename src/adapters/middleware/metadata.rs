use std::{
    convert::Infallible,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::{HeaderMap, request::Parts},
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::core::{
    middleware::{Middleware, Next},
    rate_limiter::client_ip,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataParams {
    pub generate_request_id: bool,
}

impl Default for MetadataParams {
    fn default() -> Self {
        Self {
            generate_request_id: true,
        }
    }
}

/// Caller details lifted from well-known headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMetadata {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub client_id: Option<String>,
    pub authorization: Option<String>,
    pub api_key: Option<String>,
    pub real_ip: String,
}

impl<S: Send + Sync> FromRequestParts<S> for RequestMetadata {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestMetadata>()
            .cloned()
            .unwrap_or_default())
    }
}

pub struct MetadataMiddleware {
    weight: i32,
    params: MetadataParams,
}

impl MetadataMiddleware {
    pub fn new(weight: i32, params: MetadataParams) -> Self {
        Self { weight, params }
    }
}

#[async_trait]
impl Middleware for MetadataMiddleware {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let headers = req.headers();
        let mut metadata = RequestMetadata {
            user_id: header(headers, "x-user-id"),
            request_id: header(headers, "x-request-id"),
            trace_id: header(headers, "x-trace-id"),
            client_id: header(headers, "x-client-id"),
            authorization: header(headers, "authorization"),
            api_key: header(headers, "x-api-key"),
            real_ip: client_ip(headers, req.extensions()),
        };
        if metadata.request_id.is_none() && self.params.generate_request_id {
            metadata.request_id = Some(generate_request_id());
        }
        req.extensions_mut().insert(metadata);
        next.run(req).await
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `req_<unix nanos>_<random>`.
pub fn generate_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("req_{nanos}_{}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_prefix_and_differ() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("req_"));
        assert_eq!(a.split('_').count(), 3);
        assert_ne!(a, b);
    }
}
