use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::{
    core::middleware::{Middleware, Next},
    utils::response::json_error,
};

const PREFLIGHT_VARY: &str = "Origin, Access-Control-Request-Method, Access-Control-Request-Headers";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsParams {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds
    pub max_age: u64,
}

impl Default for CorsParams {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: [
                "Origin",
                "Content-Type",
                "Accept",
                "Authorization",
                "X-Request-ID",
                "X-User-ID",
            ]
            .map(String::from)
            .to_vec(),
            exposed_headers: vec!["X-Request-ID".to_string()],
            allow_credentials: false,
            max_age: 86400,
        }
    }
}

pub struct CorsMiddleware {
    weight: i32,
    params: CorsParams,
    wildcard: bool,
}

impl CorsMiddleware {
    pub fn new(weight: i32, params: CorsParams) -> Self {
        let wildcard = params.allowed_origins.iter().any(|o| o == "*");
        Self {
            weight,
            params,
            wildcard,
        }
    }

    /// `*` allows everything; `*.example.com` allows any subdomain of example.com.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        if self.wildcard {
            return true;
        }
        let host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest);
        self.params.allowed_origins.iter().any(|allowed| {
            if allowed.eq_ignore_ascii_case(origin) {
                return true;
            }
            match allowed.strip_prefix("*.") {
                Some(domain) => {
                    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
                    host.ends_with(&format!(".{}", domain.to_ascii_lowercase()))
                }
                None => false,
            }
        })
    }

    fn allow_origin_value(&self, origin: &str) -> Option<HeaderValue> {
        if self.wildcard && !self.params.allow_credentials {
            Some(HeaderValue::from_static("*"))
        } else {
            HeaderValue::from_str(origin).ok()
        }
    }

    fn preflight(&self, origin: &str) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        if let Some(value) = self.allow_origin_value(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        set_list(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &self.params.allowed_methods);
        set_list(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.params.allowed_headers);
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(self.params.max_age),
        );
        if self.params.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.insert(header::VARY, HeaderValue::from_static(PREFLIGHT_VARY));
        response
    }
}

fn set_list(headers: &mut HeaderMap, name: header::HeaderName, values: &[String]) {
    if values.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&values.join(", ")) {
        headers.insert(name, value);
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let Some(origin) = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return next.run(req).await;
        };

        if !self.origin_allowed(&origin) {
            tracing::warn!(origin, path = %req.uri().path(), "CORS origin rejected");
            return json_error(
                StatusCode::FORBIDDEN,
                "CORS policy violation",
                "Origin not allowed",
            );
        }

        let is_preflight = req.method() == Method::OPTIONS
            && req
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        if is_preflight {
            return self.preflight(&origin);
        }

        let mut response = next.run(req).await;
        let headers = response.headers_mut();
        if let Some(value) = self.allow_origin_value(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        set_list(headers, header::ACCESS_CONTROL_EXPOSE_HEADERS, &self.params.exposed_headers);
        if self.params.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        response
    }
}
