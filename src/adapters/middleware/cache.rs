use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;

use crate::{
    core::middleware::{Middleware, Next},
    ports::cache::{CacheProvider, CachedResponse},
    utils::response::internal_error,
};

pub const CACHE_STATUS_HEADER: &str = "x-cache";
const STORED_HEADERS: [&str; 5] = [
    "content-type",
    "content-language",
    "etag",
    "last-modified",
    "cache-control",
];

/// Response cache for GET routes that opt in through their route config.
pub struct CacheMiddleware {
    weight: i32,
    cache: Arc<dyn CacheProvider>,
    default_ttl: Duration,
}

impl CacheMiddleware {
    pub fn new(weight: i32, cache: Arc<dyn CacheProvider>, default_ttl: Duration) -> Self {
        Self {
            weight,
            cache,
            default_ttl,
        }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let route_cache = match next.route().cache.clone() {
            Some(cache) if cache.enabled && req.method() == Method::GET => cache,
            _ => return next.run(req).await,
        };

        let base = route_cache.key.clone().unwrap_or_else(|| match req.uri().query() {
            Some(query) => format!("{}?{query}", req.uri().path()),
            None => req.uri().path().to_string(),
        });
        let user = req
            .headers()
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string();
        let key = self.cache.build_cache_key(
            &base,
            &route_cache.dependencies,
            &BTreeMap::from([
                ("method".to_string(), req.method().as_str().to_string()),
                ("user".to_string(), user),
            ]),
        );

        if let Some(raw) = self.cache.get(&key).await {
            match CachedResponse::from_bytes(&raw) {
                Ok(cached) => {
                    tracing::debug!(key, "Cache hit");
                    return replay(cached);
                }
                Err(e) => {
                    tracing::warn!(key, "Dropping unreadable cache entry: {}", e);
                    self.cache.delete(&key).await;
                }
            }
        }

        let response = next.run(req).await;
        let (mut parts, body) = response.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!(key, "Failed to read response body: {}", e);
                return internal_error("Failed to read response body");
            }
        };

        if storable(parts.status, &parts.headers, bytes.len()) {
            let cached = CachedResponse {
                status: parts.status.as_u16(),
                body: bytes.clone(),
                headers: STORED_HEADERS
                    .iter()
                    .filter_map(|name| {
                        parts
                            .headers
                            .get(*name)
                            .and_then(|v| v.to_str().ok())
                            .map(|v| (name.to_string(), v.to_string()))
                    })
                    .collect(),
            };
            let ttl = route_cache.ttl.unwrap_or(self.default_ttl);
            match cached.to_bytes() {
                Ok(value) => {
                    if let Err(e) = self
                        .cache
                        .set(&key, value, ttl, &route_cache.dependencies)
                        .await
                    {
                        tracing::warn!(key, "Failed to store response: {}", e);
                    }
                }
                Err(e) => tracing::warn!(key, "Failed to encode response: {}", e),
            }
        }

        parts
            .headers
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
        Response::from_parts(parts, Body::from(bytes))
    }
}

fn storable(status: StatusCode, headers: &axum::http::HeaderMap, body_len: usize) -> bool {
    if !status.is_success() || body_len == 0 {
        return false;
    }
    let cache_control = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    !cache_control.contains("no-cache") && !cache_control.contains("no-store")
}

fn replay(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
    response
}
