mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use axum::http::Method;
use common::local_service;
use keel::{
    RouteConfig, Service,
    config::{CacheConfig, MiddlewareItemConfig, MiddlewaresConfig},
};
use serde_json::json;

fn stage(enabled: bool, params: serde_json::Value) -> MiddlewareItemConfig {
    serde_json::from_value(json!({ "enabled": enabled, "params": params })).unwrap()
}

#[tokio::test]
async fn test_rate_limit_rejects_sixth_request() {
    let mut config = local_service("limited");
    config.middlewares = MiddlewaresConfig {
        enabled: true,
        recovery: stage(true, json!({})),
        rate_limit: stage(true, json!({ "requests_per_minute": 5, "window": "1m" })),
        ..Default::default()
    };
    let service = Service::new(config).unwrap();
    service
        .context()
        .router
        .add(Method::GET, "/ping", || async { "pong" }, RouteConfig::default())
        .unwrap();
    service.start().await.unwrap();

    let url = format!("http://{}/ping", service.local_addr().unwrap());
    let client = reqwest::Client::new();
    for _ in 0..5 {
        let response = client
            .get(&url)
            .header("X-Real-IP", "1.2.3.4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }
    let response = client
        .get(&url)
        .header("X-Real-IP", "1.2.3.4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");

    let other = client
        .get(&url)
        .header("X-Real-IP", "5.6.7.8")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), reqwest::StatusCode::OK);

    assert!(service.stop().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_route_disabling_cache_never_touches_store() {
    let mut config = local_service("cached");
    config.cache = CacheConfig {
        enabled: true,
        ..Default::default()
    };
    config.middlewares = MiddlewaresConfig {
        enabled: true,
        cache: stage(true, json!({})),
        ..Default::default()
    };
    let service = Service::new(config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    service
        .context()
        .router
        .add(
            Method::GET,
            "/live",
            move || {
                let counter = counter.clone();
                async move { format!("call {}", counter.fetch_add(1, Ordering::SeqCst)) }
            },
            RouteConfig::default()
                .with_cache(None, None, &[])
                .without_middlewares(["cache"]),
        )
        .unwrap();
    service.start().await.unwrap();

    let url = format!("http://{}/live", service.local_addr().unwrap());
    let first = reqwest::get(&url).await.unwrap();
    assert!(first.headers().get("x-cache").is_none());
    assert_eq!(first.text().await.unwrap(), "call 0");
    assert_eq!(reqwest::get(&url).await.unwrap().text().await.unwrap(), "call 1");

    let store = service.context().cache.as_ref().unwrap().cache().clone();
    assert_eq!(store.len(), 0);
    assert_eq!(store.stats(), (0, 0, 0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(service.stop().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cached_route_is_served_from_store() {
    let mut config = local_service("cached");
    config.cache = CacheConfig {
        enabled: true,
        ..Default::default()
    };
    config.middlewares = MiddlewaresConfig {
        enabled: true,
        cache: stage(true, json!({})),
        ..Default::default()
    };
    let service = Service::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    service
        .context()
        .router
        .add(
            Method::GET,
            "/report",
            move || {
                let counter = counter.clone();
                async move { format!("report {}", counter.fetch_add(1, Ordering::SeqCst)) }
            },
            RouteConfig::default().with_cache(None, None, &[]),
        )
        .unwrap();
    service.start().await.unwrap();

    let url = format!("http://{}/report", service.local_addr().unwrap());
    let first = reqwest::get(&url).await.unwrap();
    assert_eq!(first.headers()["x-cache"], "MISS");
    let second = reqwest::get(&url).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(second.text().await.unwrap(), "report 0");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(service.stop().await.unwrap().is_empty());
}
