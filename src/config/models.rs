//! Configuration data structures for keel services.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. Every
//! section carries defaults so that minimal configs stay concise, and every section
//! rejects unknown fields so typos surface at boot instead of being ignored.
//! Durations accept humantime strings (`"30s"`, `"5m"`) or integer seconds.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Float(f64),
        Text(String),
    }

    pub(crate) fn parse(raw: &str) -> Result<Duration, String> {
        let trimmed = raw.trim();
        if let Ok(secs) = trimmed.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        humantime::parse_duration(trimmed).map_err(|e| format!("invalid duration '{raw}': {e}"))
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Float(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            RawDuration::Float(secs) => Err(D::Error::custom(format!(
                "duration must not be negative: {secs}"
            ))),
            RawDuration::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Duration);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
        }
    }
}

/// Root configuration of a service.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service name (required)
    pub name: String,
    /// Service version (required)
    pub version: String,
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub cache: CacheConfig,
    pub actions: ActionsConfig,
    pub cron: CronConfig,
    pub auth_providers: AuthProvidersConfig,
    pub middlewares: MiddlewaresConfig,
    pub docs: DocsConfig,
    pub metrics: MetricsConfig,
    pub clients: ClientsConfig,
    pub health: HealthConfig,
    /// Budget for the whole start sequence
    #[serde(with = "duration_format")]
    pub start_timeout: Duration,
    /// Budget for the whole stop sequence
    #[serde(with = "duration_format")]
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            server: ServerConfig::default(),
            logger: LoggerConfig::default(),
            cache: CacheConfig::default(),
            actions: ActionsConfig::default(),
            cron: CronConfig::default(),
            auth_providers: AuthProvidersConfig::default(),
            middlewares: MiddlewaresConfig::default(),
            docs: DocsConfig::default(),
            metrics: MetricsConfig::default(),
            clients: ClientsConfig::default(),
            health: HealthConfig::default(),
            start_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Minimal valid configuration, mostly useful for embedding and tests.
    pub fn named(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub tls: TlsConfig,
}

/// Plain HTTP listener settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub host: String,
    /// Port to bind; `0` picks an ephemeral port
    pub port: u16,
    #[serde(with = "duration_format")]
    pub read_timeout: Duration,
    #[serde(with = "duration_format")]
    pub write_timeout: Duration,
    #[serde(with = "duration_format")]
    pub idle_timeout: Duration,
    /// Grace period for in-flight connections once the server stops
    #[serde(with = "duration_format")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// TLS settings: either manual PEM files or ACME.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Path to the PEM certificate chain
    pub cert_file: Option<String>,
    /// Path to the PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub key_file: Option<String>,
    /// Obtain certificates automatically through ACME
    pub auto_cert: bool,
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub cache_dir: Option<String>,
    /// Use the production ACME directory instead of staging
    pub production: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    /// Filter directive, e.g. `info` or `keel=debug,tower_http=info`
    pub level: String,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_spans: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Fifo,
    Lru,
    Lfu,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache engine; only `memory` is built in
    #[serde(rename = "type")]
    pub cache_type: String,
    #[serde(with = "duration_format")]
    pub default_ttl: Duration,
    pub max_entries: usize,
    #[serde(with = "duration_format")]
    pub cleanup_interval: Duration,
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_type: "memory".to_string(),
            default_ttl: Duration::from_secs(300),
            max_entries: 10_000,
            cleanup_interval: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Fifo,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ActionsConfig {
    pub enabled: bool,
    pub broker: BrokerConfig,
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub enabled: bool,
    /// Broker link type; only `websocket` is built in
    #[serde(rename = "type")]
    pub broker_type: String,
    pub config: BrokerLinkConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_type: "websocket".to_string(),
            config: BrokerLinkConfig::default(),
        }
    }
}

/// Websocket broker link settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerLinkConfig {
    pub url: String,
    #[serde(with = "duration_format")]
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_format")]
    pub ping_interval: Duration,
    #[serde(with = "duration_format")]
    pub pong_wait: Duration,
    #[serde(with = "duration_format")]
    pub write_wait: Duration,
    /// Capacity of the outbound queue
    pub queue_size: usize,
    #[serde(with = "duration_format")]
    pub dial_timeout: Duration,
    /// Group deadline for local handlers of one inbound message
    #[serde(with = "duration_format")]
    pub handler_timeout: Duration,
}

impl Default for BrokerLinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8081/ws".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_retries: 10,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            queue_size: 256,
            dial_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct WebhooksConfig {
    pub enabled: bool,
    /// User-Agent sent with subscription deliveries
    pub user_agent: String,
    /// Deadline shared by every delivery of one publish
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    /// Deadline for an inbound webhook handler
    #[serde(with = "duration_format")]
    pub handler_timeout: Duration,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_agent: format!("keel-webhooks/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct CronConfig {
    pub enabled: bool,
    /// IANA timezone name used to evaluate schedules
    pub timezone: String,
    /// Per-run deadline
    #[serde(with = "duration_format")]
    pub job_timeout: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".to_string(),
            job_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AuthProvidersConfig {
    pub token: Option<AuthProviderItemConfig>,
    pub basic: Option<AuthProviderItemConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AuthProviderItemConfig {
    pub params: HashMap<String, String>,
}

/// One middleware table entry: `{enabled, weight, params}`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewareItemConfig {
    pub enabled: bool,
    /// Overrides the stage's recommended weight
    pub weight: Option<i32>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl MiddlewareItemConfig {
    pub fn weight_or(&self, default: i32) -> i32 {
        self.weight.unwrap_or(default)
    }

    /// Decode `params` into a typed stage configuration.
    pub fn params_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MiddlewaresConfig {
    /// Master switch for the whole chain
    pub enabled: bool,
    pub recovery: MiddlewareItemConfig,
    pub logging: MiddlewareItemConfig,
    pub metadata: MiddlewareItemConfig,
    pub rate_limit: MiddlewareItemConfig,
    pub body_limit: MiddlewareItemConfig,
    pub cache: MiddlewareItemConfig,
    pub compression: MiddlewareItemConfig,
    pub cors: MiddlewareItemConfig,
    pub auth: MiddlewareItemConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DocsConfig {
    pub enabled: bool,
    /// Path of the HTML page; the document itself is served at `/openapi.json`
    pub path: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/docs".to_string(),
            title: None,
            description: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Path the Prometheus exposition is served on
    pub path: String,
    /// Global labels attached to every series
    pub labels: HashMap<String, String>,
    /// Publish process CPU, memory, task and uptime gauges
    pub system: bool,
    #[serde(with = "duration_format")]
    pub system_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
            labels: HashMap::new(),
            system: true,
            system_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    #[serde(with = "duration_format")]
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ClientsConfig {
    pub enabled: bool,
    #[serde(with = "duration_format")]
    pub default_timeout: Duration,
    pub default_retries: u32,
    /// Base of the linear retry backoff (`(attempt + 1) * base`)
    #[serde(with = "duration_format")]
    pub retry_backoff: Duration,
    /// Probe `GET {url}/health` of every service at start (warn only)
    pub health_probe: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub services: HashMap<String, ServiceClientConfig>,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_timeout: Duration::from_secs(30),
            default_retries: 3,
            retry_backoff: Duration::from_secs(1),
            health_probe: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            services: HashMap::new(),
        }
    }
}

/// A named peer service.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceClientConfig {
    /// Base URL (required)
    pub url: String,
    #[serde(with = "duration_format::option")]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Actions this peer subscribes to through its `/webhook/{action}` route
    pub events: Vec<String>,
    pub auth: Option<ServiceAuthConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceAuthConfig {
    pub provider: String,
    pub payload: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_accept_strings_and_seconds() {
        let cfg: ClientsConfig = serde_json::from_value(serde_json::json!({
            "default_timeout": "250ms",
            "retry_backoff": 2,
            "circuit_breaker": { "recovery_timeout": "1m" }
        }))
        .unwrap();
        assert_eq!(cfg.default_timeout, Duration::from_millis(250));
        assert_eq!(cfg.retry_backoff, Duration::from_secs(2));
        assert_eq!(cfg.circuit_breaker.recovery_timeout, Duration::from_secs(60));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: Result<HttpConfig, _> =
            serde_json::from_value(serde_json::json!({ "prot": 9000 }));
        assert!(result.is_err());
    }

    #[test]
    fn test_middleware_item_params() {
        #[derive(Deserialize)]
        struct Params {
            requests_per_minute: u32,
        }

        let item: MiddlewareItemConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "params": { "requests_per_minute": 5 }
        }))
        .unwrap();
        assert_eq!(item.weight_or(30), 30);
        assert_eq!(item.params_as::<Params>().unwrap().requests_per_minute, 5);
    }

    #[test]
    fn test_optional_service_timeout() {
        let svc: ServiceClientConfig = serde_json::from_value(serde_json::json!({
            "url": "http://users:8080",
            "timeout": "5s"
        }))
        .unwrap();
        assert_eq!(svc.timeout, Some(Duration::from_secs(5)));
        assert!(svc.retries.is_none());
    }
}
