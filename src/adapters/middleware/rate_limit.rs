use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        middleware::{Middleware, Next},
        rate_limiter::{RateLimiter, client_ip},
    },
    metrics,
    utils::response::json_response,
};

const RETRY_AFTER_SECS: u64 = 60;

/// Per-client-IP admission in front of everything but recovery and logging.
///
/// The idle-client sweeper runs while the stage is live: from manager start
/// when enabled by default, otherwise from the first request of a route that
/// forces it.
pub struct RateLimitMiddleware {
    weight: i32,
    limiter: Arc<RateLimiter>,
    parent: CancellationToken,
    sweeping: AtomicBool,
}

impl RateLimitMiddleware {
    pub fn new(weight: i32, limiter: Arc<RateLimiter>, parent: CancellationToken) -> Self {
        Self {
            weight,
            limiter,
            parent,
            sweeping: AtomicBool::new(false),
        }
    }

    fn ensure_sweeper(&self) {
        if !self.sweeping.swap(true, Ordering::AcqRel) {
            self.limiter.start(&self.parent);
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        self.ensure_sweeper();
        let ip = client_ip(req.headers(), req.extensions());
        if self.limiter.check(&ip) {
            metrics::increment_rate_limit("allowed");
            return next.run(req).await;
        }

        metrics::increment_rate_limit("denied");
        tracing::warn!(client_ip = %ip, path = %req.uri().path(), "Rate limit exceeded");
        let mut response = json_response(
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "error": "Rate limit exceeded",
                "message": "Too many requests",
                "retry_after": RETRY_AFTER_SECS,
            }),
        );
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        headers.insert(
            "x-ratelimit-limit",
            HeaderValue::from(self.limiter.settings().requests_per_minute),
        );
        response
    }

    fn start(&self) {
        self.ensure_sweeper();
    }

    fn stop(&self) {
        self.sweeping.store(false, Ordering::Release);
        self.limiter.stop();
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use futures_util::FutureExt;

    use super::*;
    use crate::{
        core::{
            middleware::MiddlewareManager,
            rate_limiter::RateLimitSettings,
            router::{RouteConfig, RouteHandler},
        },
        ports::component::Component,
    };

    fn stage(parent: &CancellationToken) -> Arc<RateLimitMiddleware> {
        let limiter = Arc::new(RateLimiter::new(RateLimitSettings::default()));
        Arc::new(RateLimitMiddleware::new(40, limiter, parent.clone()))
    }

    fn ok_handler() -> RouteHandler {
        Arc::new(|_req| async { Response::new(Body::from("ok")) }.boxed())
    }

    #[tokio::test]
    async fn test_sweeper_follows_manager_restart() {
        let parent = CancellationToken::new();
        let stage = stage(&parent);
        let manager = MiddlewareManager::new();
        manager.register(stage.clone(), true).unwrap();

        manager.start().await.unwrap();
        assert!(stage.limiter().is_sweeping());
        manager.stop().await.unwrap();
        assert!(!stage.limiter().is_sweeping());
        manager.start().await.unwrap();
        assert!(stage.limiter().is_sweeping());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_stage_sweeps_only_once_forced() {
        let parent = CancellationToken::new();
        let stage = stage(&parent);
        let manager = MiddlewareManager::new();
        manager.register(stage.clone(), false).unwrap();
        manager.start().await.unwrap();
        assert!(!stage.limiter().is_sweeping());

        let chain = manager.chain().unwrap();
        let request = || Request::builder().uri("/").body(Body::empty()).unwrap();
        chain
            .dispatch(request(), ok_handler(), Arc::new(RouteConfig::default()))
            .await;
        assert!(!stage.limiter().is_sweeping());

        let forced = RouteConfig::default().with_middlewares(["rate_limit"]);
        let response = chain.dispatch(request(), ok_handler(), Arc::new(forced)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(stage.limiter().is_sweeping());

        manager.stop().await.unwrap();
        assert!(!stage.limiter().is_sweeping());
    }
}
