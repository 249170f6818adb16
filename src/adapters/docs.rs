//! OpenAPI document built from route documentation metadata.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    http::{Method, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde_json::{Map, Value, json};

use crate::{
    config::models::DocsConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
        router::{RouteConfig, RouteInfo, Router},
    },
    ports::component::Component,
    utils::response::{json_response, service_unavailable},
};

pub const OPENAPI_PATH: &str = "/openapi.json";

pub struct DocsManager {
    config: DocsConfig,
    service_name: String,
    service_version: String,
    router: Arc<Router>,
    state: StateCell,
}

impl DocsManager {
    pub fn new(
        config: DocsConfig,
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            config,
            service_name: service_name.into(),
            service_version: service_version.into(),
            router,
            state: StateCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// OpenAPI 3.0 document for every route carrying `doc` metadata.
    pub fn document(&self) -> RuntimeResult<Value> {
        if !self.state.is_running() {
            return Err(RuntimeError::DocsIsNotRunning);
        }
        let title = self
            .config
            .title
            .clone()
            .unwrap_or_else(|| self.service_name.clone());
        let mut info = json!({ "title": title, "version": self.service_version });
        if let Some(description) = &self.config.description {
            info["description"] = Value::String(description.clone());
        }
        Ok(json!({
            "openapi": "3.0.3",
            "info": info,
            "paths": build_paths(&self.router.get_all_routes()),
        }))
    }

    /// Mount `GET /openapi.json` and `GET {docs.path}`.
    pub fn register_routes(self: &Arc<Self>, router: &Router) -> RuntimeResult<()> {
        let route = RouteConfig::default().without_middlewares(["auth", "cache"]);

        let docs = self.clone();
        router.add(
            Method::GET,
            OPENAPI_PATH,
            move || {
                let docs = docs.clone();
                async move {
                    match docs.document() {
                        Ok(document) => json_response(StatusCode::OK, document),
                        Err(e) => service_unavailable(e.to_string()),
                    }
                }
            },
            route.clone(),
        )?;

        let docs = self.clone();
        router.add(
            Method::GET,
            &self.config.path,
            move || {
                let docs = docs.clone();
                async move { docs.ui_page() }
            },
            route,
        )?;
        Ok(())
    }

    fn ui_page(&self) -> Response {
        if !self.state.is_running() {
            return service_unavailable(RuntimeError::DocsIsNotRunning.to_string());
        }
        let title = self.config.title.as_deref().unwrap_or(&self.service_name);
        let page = UI_TEMPLATE
            .replace("{{title}}", &escape_html(title))
            .replace("{{spec_url}}", OPENAPI_PATH);
        (
            [(header::CACHE_CONTROL, "no-cache")],
            Html(page),
        )
            .into_response()
    }
}

fn build_paths(routes: &[RouteInfo]) -> Value {
    let mut paths: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for route in routes {
        let Some(doc) = &route.config.doc else {
            continue;
        };
        let (path, params) = openapi_path(&route.path);
        let mut operation = json!({
            "summary": doc.title,
            "description": doc.description,
            "responses": { "200": { "description": "Successful response" } },
        });
        if let Some(tag) = &doc.tag {
            operation["tags"] = json!([tag]);
        }
        if !params.is_empty() {
            operation["parameters"] = params
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "in": "path",
                        "required": true,
                        "schema": { "type": "string" },
                    })
                })
                .collect();
        }
        paths
            .entry(path)
            .or_default()
            .insert(route.method.as_str().to_lowercase(), operation);
    }
    json!(paths)
}

/// Convert a route pattern to OpenAPI form and list its parameters.
fn openapi_path(pattern: &str) -> (String, Vec<String>) {
    let mut params = Vec::new();
    let path = pattern
        .split('/')
        .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => {
                let name = name.trim_start_matches('*');
                params.push(name.to_string());
                format!("{{{name}}}")
            }
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/");
    (path, params)
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const UI_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>{{title}}</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: "{{spec_url}}", dom_id: "#swagger-ui" });
    };
  </script>
</body>
</html>
"##;

#[async_trait]
impl Component for DocsManager {
    fn name(&self) -> &'static str {
        "docs"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        self.state.set(LifecycleState::Running);
        tracing::info!(path = %self.config.path, "Documentation available");
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
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}
