use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, Method, StatusCode, header},
    response::Response,
};
use http_body_util::{BodyExt, Limited};
use serde::Deserialize;
use serde_json::json;

use crate::{
    core::middleware::{Middleware, Next},
    utils::response::{bad_request, json_response},
};

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyLimitParams {
    pub max_body_size: usize,
}

impl Default for BodyLimitParams {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Caps request bodies of mutating methods.
pub struct BodyLimitMiddleware {
    weight: i32,
    max: usize,
}

impl BodyLimitMiddleware {
    pub fn new(weight: i32, params: BodyLimitParams) -> Self {
        Self {
            weight,
            max: params.max_body_size,
        }
    }

    fn too_large(&self) -> Response {
        let mut response = json_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({
                "error": "Request entity too large",
                "message": format!("Request body exceeds maximum size of {} bytes", self.max),
                "max_size": self.max,
                "error_code": "BODY_TOO_LARGE",
            }),
        );
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

fn is_limited(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[async_trait]
impl Middleware for BodyLimitMiddleware {
    fn name(&self) -> &'static str {
        "body_limit"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        if !is_limited(req.method()) {
            return next.run(req).await;
        }

        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max as u64) {
            tracing::warn!(path = %req.uri().path(), declared, max = self.max, "Request body too large");
            return self.too_large();
        }

        let (parts, body) = req.into_parts();
        let bytes = match Limited::new(body, self.max).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                tracing::warn!(path = %parts.uri.path(), max = self.max, "Request body exceeded limit while reading");
                return self.too_large();
            }
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), "Failed to read request body: {}", e);
                return bad_request("Failed to read request body");
            }
        };
        next.run(Request::from_parts(parts, Body::from(bytes))).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Bytes;
    use futures_util::{FutureExt, stream};

    use super::*;
    use crate::{
        core::{
            middleware::MiddlewareManager,
            router::{RouteConfig, RouteHandler},
        },
        ports::component::Component,
    };

    const MAX: usize = 8;

    async fn chain() -> Arc<crate::core::middleware::MiddlewareChain> {
        let manager = MiddlewareManager::new();
        let stage = BodyLimitMiddleware::new(50, BodyLimitParams { max_body_size: MAX });
        manager.register(Arc::new(stage), true).unwrap();
        manager.start().await.unwrap();
        manager.chain().unwrap()
    }

    /// Replies with the number of body bytes the handler saw.
    fn echo_len() -> RouteHandler {
        Arc::new(|req: Request| {
            async move {
                let bytes = req.into_body().collect().await.unwrap().to_bytes();
                Response::new(Body::from(bytes.len().to_string()))
            }
            .boxed()
        })
    }

    fn post(body: Body, declared: Option<usize>) -> Request {
        let mut builder = Request::builder().method(Method::POST).uri("/upload");
        if let Some(len) = declared {
            builder = builder.header(header::CONTENT_LENGTH, len);
        }
        builder.body(body).unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_declared_length_boundary() {
        let chain = chain().await;
        let route = Arc::new(RouteConfig::default());

        let response = chain
            .dispatch(post(Body::from(vec![b'x'; MAX]), Some(MAX)), echo_len(), route.clone())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, MAX.to_string());

        let response = chain
            .dispatch(post(Body::from(vec![b'x'; MAX + 1]), Some(MAX + 1)), echo_len(), route)
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        let body: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        assert_eq!(body["error_code"], "BODY_TOO_LARGE");
        assert_eq!(body["max_size"], MAX);
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit_is_rejected() {
        let chain = chain().await;
        let route = Arc::new(RouteConfig::default());
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"12345")),
            Ok(Bytes::from_static(b"6789")),
        ]);

        let response = chain
            .dispatch(post(Body::from_stream(chunks), None), echo_len(), route)
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_reads_are_not_limited() {
        let chain = chain().await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("/upload")
            .body(Body::from(vec![b'x'; MAX * 4]))
            .unwrap();

        let response = chain
            .dispatch(request, echo_len(), Arc::new(RouteConfig::default()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, (MAX * 4).to_string());
    }
}
