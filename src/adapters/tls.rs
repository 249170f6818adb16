//! TLS material for the HTTP server: PEM files or ACME.
use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};

use crate::{
    config::models::TlsConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::component::Component,
};

/// Install aws-lc-rs as the process crypto provider. Later calls are no-ops.
pub fn install_crypto_provider() {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if rustls::crypto::CryptoProvider::install_default(provider).is_err() {
        tracing::debug!("A rustls crypto provider was already installed");
    }
}

/// How the server should terminate TLS.
#[derive(Clone)]
pub enum TlsMode {
    Manual(Arc<ServerConfig>),
    Acme(AcmeSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub cache_dir: Option<String>,
    pub production: bool,
}

pub struct TlsManager {
    config: TlsConfig,
    server_config: ArcSwapOption<ServerConfig>,
    state: StateCell,
}

impl TlsManager {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config,
            server_config: ArcSwapOption::empty(),
            state: StateCell::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// The mode to serve with, once started with TLS enabled.
    pub fn mode(&self) -> Option<TlsMode> {
        if !self.config.enabled || !self.state.is_running() {
            return None;
        }
        if self.config.auto_cert {
            return Some(TlsMode::Acme(AcmeSettings {
                domains: self.config.domains.clone(),
                email: self.config.email.clone(),
                cache_dir: self.config.cache_dir.clone(),
                production: self.config.production,
            }));
        }
        self.server_config.load_full().map(TlsMode::Manual)
    }
}

/// Build a server config from a PEM chain and a PEM key (PKCS#8, PKCS#1 or SEC1).
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> RuntimeResult<ServerConfig> {
    let cert_file = File::open(cert_path).map_err(|e| {
        RuntimeError::wrap(format!("failed to open cert file {}", cert_path.display()), e)
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| RuntimeError::wrap("failed to parse certificate chain", e))?;
    if certs.is_empty() {
        return Err(RuntimeError::ConfigInvalid(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        RuntimeError::wrap(format!("failed to open key file {}", key_path.display()), e)
    })?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| RuntimeError::wrap("failed to parse private key", e))?
        .ok_or_else(|| {
            RuntimeError::ConfigInvalid(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RuntimeError::wrap("certificate and key do not match", e))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[async_trait]
impl Component for TlsManager {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        if !self.config.enabled {
            self.state.set(LifecycleState::Running);
            return Ok(());
        }

        install_crypto_provider();
        let result = if self.config.auto_cert {
            if self.config.domains.is_empty() {
                Err(RuntimeError::ConfigInvalid(
                    "server.tls.domains must not be empty when auto_cert is set".to_string(),
                ))
            } else {
                tracing::info!(domains = ?self.config.domains, production = self.config.production, "ACME certificates enabled");
                Ok(())
            }
        } else {
            match (&self.config.cert_file, &self.config.key_file) {
                (Some(cert), Some(key)) => load_server_config(Path::new(cert), Path::new(key)).map(|config| {
                    self.server_config.store(Some(Arc::new(config)));
                    tracing::info!(cert_file = %cert, "TLS certificate loaded");
                }),
                _ => Err(RuntimeError::ConfigInvalid(
                    "server.tls requires cert_file and key_file unless auto_cert is set".to_string(),
                )),
            }
        };

        match result {
            Ok(()) => {
                self.state.set(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                self.state.set(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        self.server_config.store(None);
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use rcgen::generate_simple_self_signed;

    use super::*;

    fn write_pair(dir: &Path) -> (String, String) {
        let cert = generate_simple_self_signed(["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[tokio::test]
    async fn test_manual_certificates_load() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_pair(dir.path());
        let manager = TlsManager::new(TlsConfig {
            enabled: true,
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            ..Default::default()
        });
        assert!(manager.mode().is_none());
        manager.start().await.unwrap();
        assert!(matches!(manager.mode(), Some(TlsMode::Manual(_))));
        manager.stop().await.unwrap();
        assert!(manager.mode().is_none());
    }

    #[tokio::test]
    async fn test_missing_or_garbage_material_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage.pem");
        std::fs::write(&garbage, "not a pem").unwrap();
        let manager = TlsManager::new(TlsConfig {
            enabled: true,
            cert_file: Some(garbage.to_string_lossy().into_owned()),
            key_file: Some(garbage.to_string_lossy().into_owned()),
            ..Default::default()
        });
        assert!(manager.start().await.is_err());
        assert_eq!(manager.state(), LifecycleState::Stopped);

        let manager = TlsManager::new(TlsConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(matches!(
            manager.start().await,
            Err(RuntimeError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_acme_mode_and_disabled_tls() {
        let manager = TlsManager::new(TlsConfig {
            enabled: true,
            auto_cert: true,
            domains: vec!["api.example.com".to_string()],
            ..Default::default()
        });
        manager.start().await.unwrap();
        match manager.mode() {
            Some(TlsMode::Acme(settings)) => assert_eq!(settings.domains, vec!["api.example.com"]),
            _ => panic!("expected ACME mode"),
        }

        let manager = TlsManager::new(TlsConfig::default());
        manager.start().await.unwrap();
        assert!(manager.mode().is_none());
    }
}
