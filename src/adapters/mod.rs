pub mod auth_providers;
pub mod client_manager;
pub mod config_providers;
pub mod docs;
pub mod http_client;
pub mod http_server;
pub mod memory_cache;
pub mod middleware;
pub mod system_metrics;
pub mod system_routes;
pub mod tls;
pub mod websocket_broker;

/// Re-export commonly used types from adapters
pub use auth_providers::{AuthProviderManager, BasicAuthProvider, TokenAuthProvider};
pub use client_manager::ClientManager;
pub use config_providers::{FileConfigSource, StaticConfigSource};
pub use docs::DocsManager;
pub use http_client::ServiceClient;
pub use http_server::HttpServer;
pub use memory_cache::{CacheComponent, MemoryCache};
pub use system_metrics::SystemMetricsCollector;
pub use tls::TlsManager;
pub use websocket_broker::WebSocketBroker;
