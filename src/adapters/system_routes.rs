//! Built-in operational routes: health, version and the metrics exposition.
use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    core::{
        errors::RuntimeResult,
        health::HealthManager,
        router::{RouteConfig, Router},
    },
    metrics::MetricsManager,
    utils::{
        BuildInfo,
        response::{json_response, service_unavailable},
    },
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn system_route() -> RouteConfig {
    RouteConfig::default().without_middlewares(["auth", "body_limit", "cache"])
}

/// `GET /health`: the aggregated report, or 503 while the manager is down.
pub fn register_health_route(router: &Router, health: Arc<HealthManager>) -> RuntimeResult<()> {
    router.add(
        Method::GET,
        "/health",
        move || {
            let health = health.clone();
            async move {
                match health.check().await {
                    Ok(report) => json_response(
                        StatusCode::OK,
                        serde_json::to_value(&report).unwrap_or_default(),
                    ),
                    Err(e) => service_unavailable(e.to_string()),
                }
            }
        },
        system_route(),
    )
}

/// `GET /version`: the configured service version plus build metadata.
pub fn register_version_route(
    router: &Router,
    service_version: &str,
    build: BuildInfo,
) -> RuntimeResult<()> {
    let body = json!({
        "version": service_version,
        "build_info": build.summary(),
        "details": build,
    });
    router.add(
        Method::GET,
        "/version",
        move || {
            let body = body.clone();
            async move { json_response(StatusCode::OK, body) }
        },
        system_route(),
    )
}

/// `GET {metrics.path}` in the Prometheus text format.
pub fn register_metrics_route(router: &Router, metrics: Arc<MetricsManager>) -> RuntimeResult<()> {
    let path = metrics.path().to_string();
    router.add(
        Method::GET,
        &path,
        move || {
            let metrics = metrics.clone();
            async move { render_metrics(&metrics) }
        },
        system_route().without_middlewares(["compression"]),
    )
}

fn render_metrics(metrics: &MetricsManager) -> Response {
    match metrics.render() {
        Some(text) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            )],
            text,
        )
            .into_response(),
        None => service_unavailable("Metrics exporter is not installed"),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::models::MetricsConfig,
        core::health::{CheckOutcome, ServiceInfo},
        ports::component::Component,
    };

    async fn get_json(app: axum::Router, path: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(axum::http::Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health_route_reports_checks() {
        let health = Arc::new(HealthManager::new(ServiceInfo {
            name: "svc".to_string(),
            version: "1.2.3".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }));
        health.register_checker("db", || async { CheckOutcome::unhealthy("down") });
        let router = Arc::new(Router::new(None));
        register_health_route(&router, health.clone()).unwrap();

        let (status, _) = get_json(router.into_axum(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        health.start().await.unwrap();
        let (status, report) = get_json(router.into_axum(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["status"], "unhealthy");
        assert_eq!(report["checks"]["db"]["message"], "down");
    }

    #[tokio::test]
    async fn test_version_route() {
        let router = Arc::new(Router::new(None));
        let build = BuildInfo {
            git_commit: "0123456789abcdef".to_string(),
            ..Default::default()
        };
        register_version_route(&router, "1.2.3", build).unwrap();
        let (status, body) = get_json(router.into_axum(), "/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "1.2.3");
        assert!(body["build_info"].as_str().unwrap().starts_with("dev-0123456"));
        assert_eq!(body["details"]["git_commit"], "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_metrics_route_without_exporter() {
        let metrics = Arc::new(MetricsManager::new(MetricsConfig::default()));
        let router = Arc::new(Router::new(None));
        register_metrics_route(&router, metrics).unwrap();
        let (status, _) = get_json(router.into_axum(), "/metrics").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(
            router
                .get_all_routes()
                .iter()
                .all(|r| r.config.is_disabled("auth") && r.config.is_disabled("cache"))
        );
    }
}
