use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::{config::models::ServiceConfig, core::errors::RuntimeError};

/// Prefix of environment variables overlaid on top of the file (`KEEL__SERVER__HTTP__PORT`).
pub const ENV_PREFIX: &str = "KEEL";

/// A parsed configuration: the typed model plus the raw tree it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    pub raw: serde_json::Value,
}

/// Load configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, chosen by extension (YAML when unknown).
pub async fn load_config(config_path: &str) -> Result<LoadedConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<LoadedConfig> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Err(RuntimeError::ConfigNotFound(path.display().to_string()).into());
    }

    let settings = Config::builder()
        .add_source(File::new(config_path, file_format(path)))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let raw: serde_json::Value = settings
        .clone()
        .try_deserialize()
        .with_context(|| format!("Failed to read raw config tree from {}", path.display()))?;

    let config: ServiceConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(LoadedConfig { config, raw })
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
name: "orders"
version: "1.2.0"
server:
  http:
    host: "127.0.0.1"
    port: 3000
clients:
  enabled: true
  default_timeout: "10s"
  services:
    users:
      url: "http://users:8080"
      events: ["user.created"]
middlewares:
  enabled: true
  rate_limit:
    enabled: true
    params:
      requests_per_minute: 5
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let loaded = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.config.name, "orders");
        assert_eq!(loaded.config.server.http.port, 3000);
        assert_eq!(loaded.config.clients.default_timeout, Duration::from_secs(10));
        assert_eq!(
            loaded.config.clients.services["users"].events,
            vec!["user.created".to_string()]
        );
        assert_eq!(loaded.raw["server"]["http"]["port"], 3000);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "name": "orders",
  "version": "1.0.0",
  "cron": { "enabled": true, "timezone": "Europe/Berlin" }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let loaded = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(loaded.config.cron.enabled);
        assert_eq!(loaded.config.cron.timezone, "Europe/Berlin");
        assert_eq!(loaded.config.start_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_unknown_field_fails() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "name: a\nversion: b\nserver:\n  htp: {{}}\n").unwrap();

        let result = load_config(temp_file.path().to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_config_not_found() {
        let err = load_config("/nonexistent/keel.yaml").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::ConfigNotFound(_))
        ));
    }
}
