pub mod actions;
pub mod circuit_breaker;
pub mod classify;
pub mod cron;
pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod middleware;
pub mod rate_limiter;
pub mod router;

pub use errors::{RuntimeError, RuntimeResult};
pub use lifecycle::LifecycleState;
pub use router::{RouteConfig, Router};
