pub mod auth;
pub mod broker;
pub mod cache;
pub mod component;
pub mod config_source;
pub mod http_client;
