use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;

use crate::{
    config::{
        loader::{LoadedConfig, load_config},
        models::ServiceConfig,
    },
    ports::config_source::ConfigSource,
};

/// Configuration source reading a local YAML / JSON / TOML file.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load_config(&self) -> Result<LoadedConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path_str).await
    }
}

/// Configuration source wrapping an already built model (embedding, tests).
pub struct StaticConfigSource {
    config: ServiceConfig,
}

impl StaticConfigSource {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    fn describe(&self) -> String {
        "inline".to_string()
    }

    async fn load_config(&self) -> Result<LoadedConfig> {
        let raw = serde_json::to_value(&self.config)?;
        Ok(LoadedConfig {
            config: self.config.clone(),
            raw,
        })
    }
}
