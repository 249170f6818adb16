//! Route table and request dispatch.
//!
//! Routes are registered as `(method, path)` pairs with a [`RouteConfig`] and
//! resolved with one `matchit` tree per method. The compiled tables live in an
//! `ArcSwap`, so lookups never block registration. Every matched request goes
//! through the frozen middleware chain before it reaches its handler.
use std::{
    collections::{BTreeSet, HashMap},
    convert::Infallible,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    handler::Handler,
    http::{Method, StatusCode, request::Parts},
    response::Response,
};
use futures_util::{FutureExt, future::BoxFuture};
use serde::Serialize;

use crate::{
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
        middleware::{MiddlewareChain, MiddlewareManager},
    },
    ports::component::Component,
    utils::response::{json_error, not_found},
};

pub type RouteHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Erase any axum handler into a [`RouteHandler`].
pub fn into_route_handler<H, T>(handler: H) -> RouteHandler
where
    H: Handler<T, ()>,
    T: 'static,
{
    Arc::new(move |req: Request| {
        let handler = handler.clone();
        async move { handler.call(req, ()).await }.boxed()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteCacheConfig {
    pub enabled: bool,
    /// Overrides the request path as the base of the cache key
    pub key: Option<String>,
    pub ttl: Option<Duration>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteDoc {
    pub title: String,
    pub description: String,
    pub tag: Option<String>,
}

/// Per-route settings consumed by the router and the middleware stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteConfig {
    /// Deadline for the handler itself, not the chain
    pub timeout: Option<Duration>,
    pub cache: Option<RouteCacheConfig>,
    /// Stages switched on for this route even when off globally (lowercase)
    pub middlewares: BTreeSet<String>,
    /// Stages skipped for this route (lowercase)
    pub disabled_middlewares: BTreeSet<String>,
    pub doc: Option<RouteDoc>,
}

impl RouteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, key: Option<String>, ttl: Option<Duration>, deps: &[&str]) -> Self {
        self.cache = Some(RouteCacheConfig {
            enabled: true,
            key,
            ttl,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        });
        self
    }

    pub fn with_middlewares<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.middlewares
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()));
        self
    }

    pub fn without_middlewares<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.disabled_middlewares
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()));
        self
    }

    pub fn with_doc(
        mut self,
        title: impl Into<String>,
        description: impl Into<String>,
        tag: Option<&str>,
    ) -> Self {
        self.doc = Some(RouteDoc {
            title: title.into(),
            description: description.into(),
            tag: tag.map(str::to_string),
        });
        self
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_middlewares
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn forces(&self, name: &str) -> bool {
        self.middlewares.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.as_ref().is_some_and(|c| c.enabled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub path: String,
    pub config: RouteConfig,
}

fn serialize_method<S: serde::Serializer>(method: &Method, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(method.as_str())
}

struct RouteEntry {
    info: RouteInfo,
    config: Arc<RouteConfig>,
    handler: RouteHandler,
}

#[derive(Default)]
struct RouteTables {
    by_method: HashMap<Method, matchit::Router<Arc<RouteEntry>>>,
}

/// Path parameters captured by the matched route pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(pub HashMap<String, String>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for PathParams {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<PathParams>().cloned().unwrap_or_default())
    }
}

pub struct Router {
    entries: RwLock<Vec<Arc<RouteEntry>>>,
    tables: ArcSwap<RouteTables>,
    middlewares: Option<Arc<MiddlewareManager>>,
    chain: ArcSwapOption<MiddlewareChain>,
    state: StateCell,
}

impl Router {
    pub fn new(middlewares: Option<Arc<MiddlewareManager>>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            tables: ArcSwap::from_pointee(RouteTables::default()),
            middlewares,
            chain: ArcSwapOption::empty(),
            state: StateCell::new(),
        }
    }

    /// Register `handler` for `method path`. Paths use `{name}` segments.
    pub fn add<H, T>(
        &self,
        method: Method,
        path: &str,
        handler: H,
        config: RouteConfig,
    ) -> RuntimeResult<()>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.add_route_handler(method, path, into_route_handler(handler), config)
    }

    pub fn add_route_handler(
        &self,
        method: Method,
        path: &str,
        handler: RouteHandler,
        config: RouteConfig,
    ) -> RuntimeResult<()> {
        if !path.starts_with('/') {
            return Err(RuntimeError::ConfigInvalid(format!(
                "route path must start with '/': {path}"
            )));
        }
        let entry = Arc::new(RouteEntry {
            info: RouteInfo {
                method: method.clone(),
                path: path.to_string(),
                config: config.clone(),
            },
            config: Arc::new(config),
            handler,
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut tables = RouteTables::default();
        for existing in entries.iter().chain(std::iter::once(&entry)) {
            tables
                .by_method
                .entry(existing.info.method.clone())
                .or_insert_with(matchit::Router::new)
                .insert(existing.info.path.clone(), existing.clone())
                .map_err(|e| {
                    RuntimeError::ConfigInvalid(format!(
                        "route {} {} conflicts: {e}",
                        existing.info.method, existing.info.path
                    ))
                })?;
        }
        entries.push(entry);
        self.tables.store(Arc::new(tables));
        tracing::debug!(%method, path, "Route registered");
        Ok(())
    }

    /// Start a fluent registration; nothing is added until `finalize`.
    pub fn route<H, T>(&self, method: Method, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        RouteBuilder {
            router: self,
            method,
            path: path.to_string(),
            handler: into_route_handler(handler),
            config: RouteConfig::default(),
        }
    }

    pub fn group(&self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            router: self,
            prefix: prefix.trim_end_matches('/').to_string(),
            template: RouteConfig::default(),
        }
    }

    pub fn get_all_routes(&self) -> Vec<RouteInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn set_chain(&self, chain: Option<Arc<MiddlewareChain>>) {
        self.chain.store(chain);
    }

    /// Resolve and serve one request.
    pub async fn handle(&self, mut req: Request) -> Response {
        let method = req.method().clone();
        let resolved = {
            let tables = self.tables.load();
            tables.by_method.get(&method).and_then(|tree| {
                tree.at(req.uri().path()).ok().map(|m| {
                    let params = m
                        .params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<HashMap<_, _>>();
                    (m.value.clone(), params)
                })
            })
        };

        match resolved {
            Some((entry, params)) => {
                req.extensions_mut().insert(PathParams(params));
                let handler = with_timeout(entry.handler.clone(), entry.config.timeout);
                self.dispatch(req, handler, entry.config.clone()).await
            }
            None if method == Method::OPTIONS => {
                let handler: RouteHandler =
                    Arc::new(|_req| async { not_found("Route not found") }.boxed());
                self.dispatch(req, handler, Arc::new(RouteConfig::default()))
                    .await
            }
            None => not_found("Route not found"),
        }
    }

    async fn dispatch(&self, req: Request, handler: RouteHandler, route: Arc<RouteConfig>) -> Response {
        match self.chain.load_full() {
            Some(chain) => chain.dispatch(req, handler, route).await,
            None => handler(req).await,
        }
    }

    /// Axum application serving every request through [`Router::handle`].
    pub fn into_axum(self: &Arc<Self>) -> axum::Router {
        let router = self.clone();
        axum::Router::new()
            .fallback(move |req: Request| {
                let router = router.clone();
                async move { router.handle(req).await }
            })
            .layer(tower_http::trace::TraceLayer::new_for_http())
    }
}

fn with_timeout(handler: RouteHandler, timeout: Option<Duration>) -> RouteHandler {
    match timeout {
        Some(limit) if !limit.is_zero() => Arc::new(move |req| {
            let handler = handler.clone();
            async move {
                match tokio::time::timeout(limit, handler(req)).await {
                    Ok(response) => response,
                    Err(_) => json_error(
                        StatusCode::GATEWAY_TIMEOUT,
                        "Gateway Timeout",
                        format!("Request processing exceeded {} ms", limit.as_millis()),
                    ),
                }
            }
            .boxed()
        }),
        _ => handler,
    }
}

#[async_trait]
impl Component for Router {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        if let Some(manager) = &self.middlewares {
            self.set_chain(manager.chain());
        }
        self.state.set(LifecycleState::Running);
        tracing::info!(routes = self.get_all_routes().len(), "Router started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        self.state.set(LifecycleState::Stopped);
        tracing::info!("Router stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

/// Fluent single-route registration.
pub struct RouteBuilder<'a> {
    router: &'a Router,
    method: Method,
    path: String,
    handler: RouteHandler,
    config: RouteConfig,
}

impl RouteBuilder<'_> {
    pub fn with_cache(mut self, key: Option<&str>, ttl: Option<Duration>, deps: &[&str]) -> Self {
        self.config = self.config.with_cache(key.map(str::to_string), ttl, deps);
        self
    }

    pub fn with_middlewares(mut self, names: &[&str]) -> Self {
        self.config = self.config.with_middlewares(names);
        self
    }

    pub fn without_middlewares(mut self, names: &[&str]) -> Self {
        self.config = self.config.without_middlewares(names);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    pub fn with_doc(mut self, title: &str, description: &str, tag: Option<&str>) -> Self {
        self.config = self.config.with_doc(title, description, tag);
        self
    }

    pub fn finalize(self) -> RuntimeResult<()> {
        self.router
            .add_route_handler(self.method, &self.path, self.handler, self.config)
    }
}

/// Routes sharing a path prefix and a config template.
pub struct RouteGroup<'a> {
    router: &'a Router,
    prefix: String,
    template: RouteConfig,
}

impl RouteGroup<'_> {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.template = self.template.with_timeout(timeout);
        self
    }

    pub fn with_middlewares(mut self, names: &[&str]) -> Self {
        self.template = self.template.with_middlewares(names);
        self
    }

    pub fn without_middlewares(mut self, names: &[&str]) -> Self {
        self.template = self.template.without_middlewares(names);
        self
    }

    pub fn add<H, T>(&self, method: Method, path: &str, handler: H) -> RuntimeResult<()>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.router.add(
            method,
            &self.full_path(path),
            handler,
            self.template.clone(),
        )
    }

    /// Builder seeded with the group template.
    pub fn route<H, T>(&self, method: Method, path: &str, handler: H) -> RouteBuilder<'_>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        RouteBuilder {
            router: self.router,
            method,
            path: self.full_path(path),
            handler: into_route_handler(handler),
            config: self.template.clone(),
        }
    }

    fn full_path(&self, path: &str) -> String {
        match path {
            "" | "/" => {
                if self.prefix.is_empty() {
                    "/".to_string()
                } else {
                    self.prefix.clone()
                }
            }
            p if p.starts_with('/') => format!("{}{}", self.prefix, p),
            p => format!("{}/{}", self.prefix, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_path_params_reach_handler() {
        let router = Arc::new(Router::new(None));
        router
            .add(
                Method::GET,
                "/users/{id}",
                |params: PathParams| async move { format!("user {}", params.get("id").unwrap_or("?")) },
                RouteConfig::default(),
            )
            .unwrap();

        let response = router
            .into_axum()
            .oneshot(request(Method::GET, "/users/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"user 42");
    }

    #[tokio::test]
    async fn test_unknown_route_and_method_mismatch_are_404() {
        let router = Arc::new(Router::new(None));
        router
            .add(Method::GET, "/items", || async { "items" }, RouteConfig::default())
            .unwrap();

        let response = router.handle(request(Method::GET, "/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Not Found");

        let response = router.handle(request(Method::POST, "/items")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_then_start_again() {
        let router = Router::new(None);
        assert!(matches!(router.stop().await, Err(RuntimeError::NotRunning)));
        router.start().await.unwrap();
        router.stop().await.unwrap();
        assert_eq!(router.state(), LifecycleState::Stopped);
        assert!(matches!(router.stop().await, Err(RuntimeError::NotRunning)));
        router.start().await.unwrap();
        assert!(router.is_running());
    }

    #[tokio::test]
    async fn test_handler_timeout_returns_504() {
        let router = Router::new(None);
        router
            .route(Method::GET, "/slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            })
            .with_timeout(Duration::from_millis(20))
            .finalize()
            .unwrap();

        let response = router.handle(request(Method::GET, "/slow")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            body_json(response).await["message"],
            "Request processing exceeded 20 ms"
        );
    }

    #[test]
    fn test_duplicate_route_is_rejected() {
        let router = Router::new(None);
        router
            .add(Method::GET, "/a", || async { "a" }, RouteConfig::default())
            .unwrap();
        assert!(matches!(
            router.add(Method::GET, "/a", || async { "b" }, RouteConfig::default()),
            Err(RuntimeError::ConfigInvalid(_))
        ));
        assert!(
            router
                .add(Method::POST, "/a", || async { "c" }, RouteConfig::default())
                .is_ok()
        );
        assert_eq!(router.get_all_routes().len(), 2);
    }

    #[test]
    fn test_group_applies_prefix_and_template() {
        let router = Router::new(None);
        let api = router
            .group("/api/v1/")
            .without_middlewares(&["Auth"])
            .with_timeout(Duration::from_secs(2));
        api.add(Method::GET, "orders", || async { "orders" }).unwrap();
        api.route(Method::GET, "/orders/{id}", || async { "order" })
            .with_cache(None, Some(Duration::from_secs(60)), &["orders"])
            .finalize()
            .unwrap();

        let routes = router.get_all_routes();
        assert_eq!(routes[0].path, "/api/v1/orders");
        assert!(routes[0].config.is_disabled("auth"));
        assert_eq!(routes[1].path, "/api/v1/orders/{id}");
        assert!(routes[1].config.cache_enabled());
        assert_eq!(routes[1].config.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_middleware_names_are_case_insensitive() {
        let config = RouteConfig::default()
            .without_middlewares(["BodyLimit", "cache"])
            .with_middlewares(["Compression"]);
        assert!(config.is_disabled("bodylimit"));
        assert!(config.is_disabled("CACHE"));
        assert!(config.forces("compression"));
        assert!(!config.forces("cors"));
    }
}
