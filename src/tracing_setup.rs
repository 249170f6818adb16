use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::models::{LogFormat, LoggerConfig},
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::component::Component,
};

/// Initialize structured logging with JSON output at `info`
pub fn init_tracing() -> Result<()> {
    init_tracing_with_config("info", true, false)
}

/// Initialize logging from the `logger` config section.
pub fn init_from_config(config: &LoggerConfig) -> Result<()> {
    init_tracing_with_config(
        &config.level,
        config.format == LogFormat::Json,
        config.include_spans,
    )
}

/// Initialize tracing with custom configuration. `RUST_LOG` wins over `level` when set.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };

    // A subscriber installed earlier (tests, embedding applications) stays in place.
    if let Err(e) = installed {
        tracing::debug!("Global subscriber already installed: {}", e);
        return Ok(());
    }

    tracing::info!(
        "keel logging initialized with level: {}, json: {}, spans: {}",
        level,
        json_format,
        include_spans
    );
    Ok(())
}

/// Configure tracing for specific service components
pub fn configure_component_tracing(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span for a call to a peer service
pub fn create_outbound_span(service: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "outbound_request",
        peer.service = service,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
        attempt = tracing::field::Empty,
    )
}

/// Installs the global subscriber as part of the service start sequence.
pub struct LoggerComponent {
    config: LoggerConfig,
    state: StateCell,
}

impl LoggerComponent {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
        }
    }
}

#[async_trait]
impl Component for LoggerComponent {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        if let Err(e) = init_from_config(&self.config) {
            self.state.set(LifecycleState::Stopped);
            return Err(RuntimeError::ConfigInvalid(format!("logger: {e}")));
        }
        self.state.set(LifecycleState::Running);
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}
