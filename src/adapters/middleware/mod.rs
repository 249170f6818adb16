//! Built-in middleware stages and the factory wiring them from configuration.
//!
//! Each stage lives in its own module and implements
//! [`Middleware`](crate::core::middleware::Middleware). [`register_configured`]
//! decodes `middlewares.<stage>.params`, applies weight overrides and
//! registers the stages on a [`MiddlewareManager`]. A stage whose `enabled`
//! flag is off is still registered, but only runs on routes that force it.
use std::{sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::auth_providers::AuthProviderManager,
    config::models::{MiddlewareItemConfig, MiddlewaresConfig},
    core::{
        errors::{RuntimeError, RuntimeResult},
        middleware::MiddlewareManager,
        rate_limiter::{RateLimitSettings, RateLimiter},
    },
    ports::cache::CacheProvider,
};

pub mod auth;
pub mod body_limit;
pub mod cache;
pub mod compression;
pub mod cors;
pub mod logging;
pub mod metadata;
pub mod rate_limit;
pub mod recovery;

pub use auth::AuthMiddleware;
pub use body_limit::BodyLimitMiddleware;
pub use cache::CacheMiddleware;
pub use compression::CompressionMiddleware;
pub use cors::CorsMiddleware;
pub use logging::LoggingMiddleware;
pub use metadata::{MetadataMiddleware, RequestMetadata};
pub use rate_limit::RateLimitMiddleware;
pub use recovery::RecoveryMiddleware;

pub const RECOVERY_WEIGHT: i32 = 10;
pub const LOGGING_WEIGHT: i32 = 20;
pub const METADATA_WEIGHT: i32 = 25;
pub const RATE_LIMIT_WEIGHT: i32 = 30;
pub const BODY_LIMIT_WEIGHT: i32 = 40;
pub const CACHE_WEIGHT: i32 = 50;
pub const COMPRESSION_WEIGHT: i32 = 60;
pub const CORS_WEIGHT: i32 = 70;
pub const AUTH_WEIGHT: i32 = 80;

/// Shared resources some stages need.
pub struct StageDeps {
    pub service: String,
    pub cache: Option<(Arc<dyn CacheProvider>, Duration)>,
    pub auth: Option<Arc<AuthProviderManager>>,
    /// Parent of background tasks such as the rate limiter sweeper
    pub cancel: CancellationToken,
}

fn params<T: DeserializeOwned>(stage: &str, item: &MiddlewareItemConfig) -> RuntimeResult<T> {
    item.params_as().map_err(|e| {
        RuntimeError::ConfigInvalid(format!("middlewares.{stage}.params: {e}"))
    })
}

/// Register every built-in stage described by `config`.
pub fn register_configured(
    manager: &MiddlewareManager,
    config: &MiddlewaresConfig,
    deps: StageDeps,
) -> RuntimeResult<()> {
    if !config.enabled {
        tracing::info!("Middleware chain disabled by configuration");
        return Ok(());
    }

    let item = &config.recovery;
    manager.register(
        Arc::new(RecoveryMiddleware::new(
            item.weight_or(RECOVERY_WEIGHT),
            params("recovery", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.logging;
    manager.register(
        Arc::new(LoggingMiddleware::new(
            item.weight_or(LOGGING_WEIGHT),
            deps.service.clone(),
            params("logging", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.metadata;
    manager.register(
        Arc::new(MetadataMiddleware::new(
            item.weight_or(METADATA_WEIGHT),
            params("metadata", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.rate_limit;
    let settings: RateLimitSettings = params("rate_limit", item)?;
    if settings.requests_per_minute == 0 {
        return Err(RuntimeError::ConfigInvalid(
            "middlewares.rate_limit.params.requests_per_minute must be positive".to_string(),
        ));
    }
    manager.register(
        Arc::new(RateLimitMiddleware::new(
            item.weight_or(RATE_LIMIT_WEIGHT),
            Arc::new(RateLimiter::new(settings)),
            deps.cancel.clone(),
        )),
        item.enabled,
    )?;

    let item = &config.body_limit;
    manager.register(
        Arc::new(BodyLimitMiddleware::new(
            item.weight_or(BODY_LIMIT_WEIGHT),
            params("body_limit", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.cache;
    match &deps.cache {
        Some((cache, default_ttl)) => manager.register(
            Arc::new(CacheMiddleware::new(
                item.weight_or(CACHE_WEIGHT),
                cache.clone(),
                *default_ttl,
            )),
            item.enabled,
        )?,
        None if item.enabled => {
            tracing::warn!("Cache middleware enabled but no cache is configured; skipping");
        }
        None => {}
    }

    let item = &config.compression;
    manager.register(
        Arc::new(CompressionMiddleware::new(
            item.weight_or(COMPRESSION_WEIGHT),
            params("compression", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.cors;
    manager.register(
        Arc::new(CorsMiddleware::new(
            item.weight_or(CORS_WEIGHT),
            params("cors", item)?,
        )),
        item.enabled,
    )?;

    let item = &config.auth;
    match &deps.auth {
        Some(providers) => manager.register(
            Arc::new(AuthMiddleware::new(
                item.weight_or(AUTH_WEIGHT),
                params("auth", item)?,
                providers.clone(),
            )),
            item.enabled,
        )?,
        None if item.enabled => {
            return Err(RuntimeError::ConfigInvalid(
                "auth middleware enabled but no auth providers are configured".to_string(),
            ));
        }
        None => {}
    }

    Ok(())
}
