//! keel - a service runtime framework.
//!
//! keel composes the pieces every HTTP service ends up rebuilding into one
//! lifecycle-managed process: an HTTP server with a weight-ordered middleware
//! chain, a sharded rate limiter, a response cache, circuit-breaker guarded
//! clients for peer services, an event dispatcher fanning actions out to a
//! websocket broker link and webhook subscribers, a cron scheduler, health and
//! version endpoints, OpenAPI docs and Prometheus metrics.
//!
//! # Quick Example
//! ```no_run
//! use axum::http::Method;
//! use keel::{RouteConfig, Service, config::ServiceConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let service = Service::new(ServiceConfig::named("orders", "1.0.0"))?;
//! service.context().router.add(
//!     Method::GET,
//!     "/orders/{id}",
//!     || async { "order" },
//!     RouteConfig::default().with_doc("Get order", "Fetch a single order", Some("orders")),
//! )?;
//! service.run().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits at the seams: components, auth,
//! cache, broker, config sources) from **adapters** (their implementations)
//! while keeping the runtime logic inside `core`. The [`service`] module wires
//! everything into an explicit [`ServiceContext`] and drives start and stop
//! in dependency order.
//!
//! # Error Handling
//! Component operations return [`RuntimeResult`]. Errors crossing a component
//! boundary are wrapped with context while keeping the cause as `source`.
//! The binary uses `eyre` at its edges.
//!
//! # Concurrency & Data Structures
//! Long-running work runs on tokio tasks rooted in cancellation tokens owned
//! by the service. Hot read paths use `arc_swap` snapshots; concurrent maps use
//! `scc`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;
pub mod service;

pub use crate::{
    core::{LifecycleState, RouteConfig, Router, RuntimeError, RuntimeResult},
    ports::component::Component,
    service::{Service, ServiceContext},
    utils::{GracefulShutdown, ShutdownHandle, ShutdownReason},
};
