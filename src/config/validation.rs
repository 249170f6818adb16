#![allow(clippy::collapsible_if)]

use std::collections::HashMap;

use eyre::Result;

use crate::config::models::{
    ActionsConfig, CircuitBreakerConfig, MiddlewaresConfig, ServiceConfig, TlsConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Middleware conflict detected: {message}")]
    MiddlewareConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Service configuration validator
pub struct ServiceConfigValidator;

impl ServiceConfigValidator {
    /// Validate the entire service configuration, reporting every problem at once
    pub fn validate(config: &ServiceConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "name".to_string(),
            });
        }
        if config.version.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "version".to_string(),
            });
        }

        if config.server.http.host.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "server.http.host".to_string(),
            });
        }

        if config.server.tls.enabled {
            if let Err(e) = Self::validate_tls_config(&config.server.tls) {
                errors.push(e);
            }
        }

        if let Err(e) = Self::validate_log_level(&config.logger.level) {
            errors.push(e);
        }

        if config.cache.enabled {
            if config.cache.cache_type != "memory" {
                errors.push(ValidationError::InvalidField {
                    field: "cache.type".to_string(),
                    message: format!("Unknown cache type '{}'", config.cache.cache_type),
                });
            }
            if config.cache.max_entries == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "cache.max_entries".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if config.cron.enabled {
            if let Err(e) = Self::validate_timezone(&config.cron.timezone) {
                errors.push(e);
            }
        }

        if config.actions.enabled {
            errors.extend(Self::validate_actions(&config.actions));
        }

        if config.middlewares.enabled {
            if let Err(e) = Self::check_middleware_weights(&config.middlewares) {
                errors.push(e);
            }
        }

        if config.docs.enabled {
            if let Err(e) = Self::validate_route_path(&config.docs.path, "docs.path") {
                errors.push(e);
            }
        }

        if config.metrics.enabled {
            if let Err(e) = Self::validate_route_path(&config.metrics.path, "metrics.path") {
                errors.push(e);
            }
        }

        if config.clients.enabled {
            if let Err(e) =
                Self::validate_breaker(&config.clients.circuit_breaker, "clients.circuit_breaker")
            {
                errors.push(e);
            }
            for (name, service) in &config.clients.services {
                if service.url.trim().is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("clients.services.{name}.url"),
                    });
                } else if let Err(e) =
                    Self::validate_url(&service.url, &format!("clients.services.{name}.url"))
                {
                    errors.push(e);
                }
                if let Some(breaker) = &service.circuit_breaker {
                    if let Err(e) = Self::validate_breaker(
                        breaker,
                        &format!("clients.services.{name}.circuit_breaker"),
                    ) {
                        errors.push(e);
                    }
                }
                if let Some(auth) = &service.auth {
                    if !matches!(auth.provider.as_str(), "token" | "basic") {
                        errors.push(ValidationError::InvalidField {
                            field: format!("clients.services.{name}.auth.provider"),
                            message: format!("Unknown auth provider '{}'", auth.provider),
                        });
                    }
                }
            }
        }

        if config.start_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "start_timeout".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.shutdown_timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown_timeout".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.metrics.enabled && config.metrics.system && config.metrics.system_interval.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "metrics.system_interval".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate URL format (http/https with a host)
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate WebSocket URL format
    fn validate_websocket_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "ws" && url.scheme() != "wss" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "WebSocket URL scheme must be 'ws' or 'wss', got '{}'",
                            url.scheme()
                        ),
                    });
                }
                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid WebSocket URL format: {e}"),
            }),
        }
    }

    fn validate_route_path(path: &str, field: &str) -> ValidationResult<()> {
        if !path.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Paths must start with '/'".to_string(),
            });
        }
        Ok(())
    }

    fn validate_log_level(level: &str) -> ValidationResult<()> {
        tracing_subscriber::EnvFilter::try_new(level)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "logger.level".to_string(),
                message: format!("Invalid log filter '{level}': {e}"),
            })
    }

    fn validate_timezone(timezone: &str) -> ValidationResult<()> {
        timezone
            .parse::<chrono_tz::Tz>()
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "cron.timezone".to_string(),
                message: format!("Unknown timezone '{timezone}': {e}"),
            })
    }

    fn validate_breaker(config: &CircuitBreakerConfig, field: &str) -> ValidationResult<()> {
        if !config.enabled {
            return Ok(());
        }
        if config.failure_threshold == 0 || config.half_open_requests == 0 {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "failure_threshold and half_open_requests must be greater than 0"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_actions(config: &ActionsConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.broker.enabled {
            if config.broker.broker_type != "websocket" {
                errors.push(ValidationError::InvalidField {
                    field: "actions.broker.type".to_string(),
                    message: format!("Unknown broker type '{}'", config.broker.broker_type),
                });
            }
            if let Err(e) =
                Self::validate_websocket_url(&config.broker.config.url, "actions.broker.config.url")
            {
                errors.push(e);
            }
            if config.broker.config.queue_size == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "actions.broker.config.queue_size".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }
        errors
    }

    /// Validate TLS configuration
    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if config.auto_cert {
            if config.domains.is_empty() {
                return Err(ValidationError::InvalidTls {
                    message: "ACME configuration must include at least one domain".to_string(),
                });
            }
            if config.email.as_deref().is_none_or(|e| e.trim().is_empty()) {
                return Err(ValidationError::InvalidTls {
                    message: "ACME configuration must include a contact email".to_string(),
                });
            }
            return Ok(());
        }

        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    return Err(ValidationError::InvalidTls {
                        message: format!("Certificate file does not exist: {cert}"),
                    });
                }

                if !std::path::Path::new(key).exists() {
                    return Err(ValidationError::InvalidTls {
                        message: format!("Private key file does not exist: {key}"),
                    });
                }

                Ok(())
            }
            _ => Err(ValidationError::InvalidTls {
                message: "TLS configuration must specify either cert_file and key_file, or auto_cert with domains".to_string(),
            }),
        }
    }

    /// Enabled stages must not share a weight
    fn check_middleware_weights(config: &MiddlewaresConfig) -> ValidationResult<()> {
        let items = [
            ("recovery", &config.recovery, 10),
            ("logging", &config.logging, 20),
            ("metadata", &config.metadata, 25),
            ("rate_limit", &config.rate_limit, 30),
            ("body_limit", &config.body_limit, 40),
            ("cache", &config.cache, 50),
            ("compression", &config.compression, 60),
            ("cors", &config.cors, 70),
            ("auth", &config.auth, 80),
        ];

        let mut seen: HashMap<i32, &str> = HashMap::new();
        for (name, item, default_weight) in items {
            if !item.enabled {
                continue;
            }
            let weight = item.weight_or(default_weight);
            if let Some(existing) = seen.insert(weight, name) {
                return Err(ValidationError::MiddlewareConflict {
                    message: format!(
                        "duplicate weight {weight} for middlewares '{existing}' and '{name}'"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{ServiceAuthConfig, ServiceClientConfig};

    fn minimal_valid_config() -> ServiceConfig {
        ServiceConfig::named("orders", "1.0.0")
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServiceConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_reports_all_missing_fields() {
        let config = ServiceConfig::default();
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Found 2 validation errors"));
        assert!(message.contains("name"));
        assert!(message.contains("version"));
    }

    #[test]
    fn validate_rejects_duplicate_middleware_weights() {
        let mut config = minimal_valid_config();
        config.middlewares.enabled = true;
        config.middlewares.recovery.enabled = true;
        config.middlewares.logging.enabled = true;
        config.middlewares.logging.weight = Some(10);
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate weight 10"));
    }

    #[test]
    fn validate_rejects_zero_system_metrics_interval() {
        let mut config = minimal_valid_config();
        config.metrics.enabled = true;
        config.metrics.system_interval = std::time::Duration::ZERO;
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("metrics.system_interval"));

        config.metrics.system = false;
        assert!(ServiceConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_bad_service_url_and_provider() {
        let mut config = minimal_valid_config();
        config.clients.enabled = true;
        config.clients.services.insert(
            "users".to_string(),
            ServiceClientConfig {
                url: "ftp://users".to_string(),
                auth: Some(ServiceAuthConfig {
                    provider: "oauth".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("URL scheme must be 'http' or 'https'"));
        assert!(message.contains("Unknown auth provider 'oauth'"));
    }

    #[test]
    fn validate_rejects_empty_acme_domains() {
        let mut config = minimal_valid_config();
        config.server.tls.enabled = true;
        config.server.tls.auto_cert = true;
        config.server.tls.email = Some("ops@example.com".to_string());
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("at least one domain"));
    }

    #[test]
    fn validate_rejects_unknown_timezone() {
        let mut config = minimal_valid_config();
        config.cron.enabled = true;
        config.cron.timezone = "Mars/Olympus".to_string();
        assert!(ServiceConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_non_websocket_broker_url() {
        let mut config = minimal_valid_config();
        config.actions.enabled = true;
        config.actions.broker.enabled = true;
        config.actions.broker.config.url = "http://broker:8081".to_string();
        let err = ServiceConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("'ws' or 'wss'"));
    }
}
