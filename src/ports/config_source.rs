use async_trait::async_trait;
use eyre::Result;

use crate::config::loader::LoadedConfig;

/// Trait for configuration sources the service boots from.
///
/// Sources are read once at boot; keel does not hot-reload configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Human readable origin of the configuration (path, "inline", ...).
    fn describe(&self) -> String;

    /// Load and parse the configuration.
    async fn load_config(&self) -> Result<LoadedConfig>;
}
