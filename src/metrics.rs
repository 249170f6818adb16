//! Metrics helpers for keel services.
//!
//! This module wraps the `metrics` crate macros with named helpers and RAII
//! timers, describes every metric family once, and optionally installs a
//! Prometheus recorder whose rendering is served on the configured path.
//!
//! Provided metrics (labels vary by family):
//! * `http_requests_total`, `http_request_duration_seconds` (inbound pipeline)
//! * `http_client_requests_total`, `http_client_request_duration_seconds`,
//!   `http_client_requests_in_flight`, `http_client_circuit_breaker_status`
//! * `rate_limit_requests_total`, `compression_requests_total`
//! * `action_operations_total`, `websocket_operations_total`
//! * `cron_job_executions_total`, `cron_job_errors_total`, `cron_job_duration_seconds`,
//!   `cron_active_jobs`, `cron_scheduler_running`
//! * `cache_hits_total`, `cache_misses_total`, `cache_evictions_total`
//! * `system_cpu_usage_percent`, `system_memory_usage_bytes`, `system_tasks_count`,
//!   `system_runtime_workers`, `system_uptime_seconds` (process collector)
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};

use crate::{
    config::models::MetricsConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::component::Component,
};

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HTTP_CLIENT_REQUESTS_TOTAL: &str = "http_client_requests_total";
pub const HTTP_CLIENT_REQUEST_DURATION_SECONDS: &str = "http_client_request_duration_seconds";
pub const HTTP_CLIENT_REQUESTS_IN_FLIGHT: &str = "http_client_requests_in_flight";
pub const HTTP_CLIENT_CIRCUIT_BREAKER_STATUS: &str = "http_client_circuit_breaker_status";
pub const RATE_LIMIT_REQUESTS_TOTAL: &str = "rate_limit_requests_total";
pub const COMPRESSION_REQUESTS_TOTAL: &str = "compression_requests_total";
pub const ACTION_OPERATIONS_TOTAL: &str = "action_operations_total"; // labels: operation, result, action
pub const ACTION_OPERATION_DURATION_SECONDS: &str = "action_operation_duration_seconds";
pub const WEBSOCKET_OPERATIONS_TOTAL: &str = "websocket_operations_total"; // labels: operation, result, action
pub const WEBSOCKET_OPERATION_DURATION_SECONDS: &str = "websocket_operation_duration_seconds";
pub const CRON_JOB_EXECUTIONS_TOTAL: &str = "cron_job_executions_total";
pub const CRON_JOB_ERRORS_TOTAL: &str = "cron_job_errors_total";
pub const CRON_JOB_DURATION_SECONDS: &str = "cron_job_duration_seconds";
pub const CRON_ACTIVE_JOBS: &str = "cron_active_jobs";
pub const CRON_SCHEDULER_RUNNING: &str = "cron_scheduler_running";
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
pub const SYSTEM_CPU_USAGE_PERCENT: &str = "system_cpu_usage_percent";
pub const SYSTEM_MEMORY_USAGE_BYTES: &str = "system_memory_usage_bytes"; // labels: type
pub const SYSTEM_TASKS_COUNT: &str = "system_tasks_count";
pub const SYSTEM_RUNTIME_WORKERS: &str = "system_runtime_workers";
pub const SYSTEM_UPTIME_SECONDS: &str = "system_uptime_seconds";

/// Breaker states reported through `http_client_circuit_breaker_status`.
pub const BREAKER_STATES: [&str; 4] = ["closed", "half-open", "open", "stopped"];

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of inbound HTTP requests handled by the pipeline."
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of inbound HTTP requests."
    );
    describe_counter!(
        HTTP_CLIENT_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of outbound requests to peer services."
    );
    describe_histogram!(
        HTTP_CLIENT_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of outbound requests to peer services, retries included."
    );
    describe_gauge!(
        HTTP_CLIENT_REQUESTS_IN_FLIGHT,
        "Outbound requests currently in flight per service."
    );
    describe_gauge!(
        HTTP_CLIENT_CIRCUIT_BREAKER_STATUS,
        "1 for the current circuit breaker state of a service, 0 for the others."
    );
    describe_counter!(
        RATE_LIMIT_REQUESTS_TOTAL,
        Unit::Count,
        "Rate limiter decisions (allowed / blocked)."
    );
    describe_counter!(
        COMPRESSION_REQUESTS_TOTAL,
        Unit::Count,
        "Response compression outcomes by algorithm."
    );
    describe_counter!(
        ACTION_OPERATIONS_TOTAL,
        Unit::Count,
        "Event dispatcher operations."
    );
    describe_histogram!(
        ACTION_OPERATION_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of event dispatcher operations."
    );
    describe_counter!(
        WEBSOCKET_OPERATIONS_TOTAL,
        Unit::Count,
        "Broker link operations."
    );
    describe_histogram!(
        WEBSOCKET_OPERATION_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of broker link operations."
    );
    describe_counter!(
        CRON_JOB_EXECUTIONS_TOTAL,
        Unit::Count,
        "Cron job runs by result."
    );
    describe_counter!(CRON_JOB_ERRORS_TOTAL, Unit::Count, "Failed cron job runs.");
    describe_histogram!(
        CRON_JOB_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of cron job runs."
    );
    describe_gauge!(CRON_ACTIVE_JOBS, "Cron job runs currently executing.");
    describe_gauge!(CRON_SCHEDULER_RUNNING, "1 while the cron scheduler runs.");
    describe_counter!(CACHE_HITS_TOTAL, Unit::Count, "Cache lookups that hit.");
    describe_counter!(CACHE_MISSES_TOTAL, Unit::Count, "Cache lookups that missed.");
    describe_counter!(
        CACHE_EVICTIONS_TOTAL,
        Unit::Count,
        "Cache entries evicted to respect the capacity."
    );
    describe_gauge!(
        SYSTEM_CPU_USAGE_PERCENT,
        Unit::Percent,
        "Process CPU usage over the last sampling interval."
    );
    describe_gauge!(
        SYSTEM_MEMORY_USAGE_BYTES,
        Unit::Bytes,
        "Process memory by type (resident / virtual)."
    );
    describe_gauge!(SYSTEM_TASKS_COUNT, "Tasks alive on the async runtime.");
    describe_gauge!(SYSTEM_RUNTIME_WORKERS, "Worker threads of the async runtime.");
    describe_gauge!(
        SYSTEM_UPTIME_SECONDS,
        Unit::Seconds,
        "Seconds since the service was built."
    );
});

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Describe every metric family (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Install the process-wide Prometheus recorder once and return its handle.
///
/// Global labels are taken from the first installation.
pub fn install_prometheus(config: &MetricsConfig) -> eyre::Result<PrometheusHandle> {
    let handle = PROMETHEUS.get_or_try_init(|| -> eyre::Result<PrometheusHandle> {
        let mut builder = PrometheusBuilder::new();
        for (key, value) in &config.labels {
            builder = builder.add_global_label(key.clone(), value.clone());
        }
        let recorder = builder.build_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| eyre::eyre!("Failed to install Prometheus recorder: {e}"))?;
        tracing::info!("Prometheus recorder installed");
        Ok(handle)
    })?;
    init_metrics();
    Ok(handle.clone())
}

pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(path: &str, method: &str, duration: Duration) {
    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_client_request(service: &str, method: &str, status: &str) {
    counter!(
        HTTP_CLIENT_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn set_client_in_flight(service: &str, delta: f64) {
    gauge!(HTTP_CLIENT_REQUESTS_IN_FLIGHT, "service" => service.to_string()).increment(delta);
}

/// Set the current breaker state gauge to 1 and every other state to 0.
pub fn set_breaker_state(service: &str, state: &str) {
    for candidate in BREAKER_STATES {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!(
            HTTP_CLIENT_CIRCUIT_BREAKER_STATUS,
            "service" => service.to_string(),
            "state" => candidate
        )
        .set(value);
    }
}

pub fn increment_rate_limit(result: &'static str) {
    counter!(RATE_LIMIT_REQUESTS_TOTAL, "result" => result).increment(1);
}

pub fn increment_compression(algorithm: &str, result: &'static str) {
    counter!(
        COMPRESSION_REQUESTS_TOTAL,
        "algorithm" => algorithm.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_action_operation(operation: &str, result: &str, action: &str, duration: Duration) {
    counter!(
        ACTION_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "result" => result.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
    histogram!(
        ACTION_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string(),
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_websocket_operation(operation: &str, result: &str, action: &str, duration: Duration) {
    counter!(
        WEBSOCKET_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "result" => result.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
    histogram!(
        WEBSOCKET_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string(),
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_cron_execution(job_name: &str, result: &'static str, duration: Duration) {
    counter!(
        CRON_JOB_EXECUTIONS_TOTAL,
        "job_name" => job_name.to_string(),
        "result" => result
    )
    .increment(1);
    if result != "success" {
        counter!(CRON_JOB_ERRORS_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }
    histogram!(CRON_JOB_DURATION_SECONDS, "job_name" => job_name.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_cron_active_jobs(count: usize) {
    gauge!(CRON_ACTIVE_JOBS).set(count as f64);
}

pub fn set_cron_scheduler_running(running: bool) {
    gauge!(CRON_SCHEDULER_RUNNING).set(if running { 1.0 } else { 0.0 });
}

pub fn increment_cache_hit() {
    counter!(CACHE_HITS_TOTAL).increment(1);
}

pub fn increment_cache_miss() {
    counter!(CACHE_MISSES_TOTAL).increment(1);
}

pub fn increment_cache_eviction() {
    counter!(CACHE_EVICTIONS_TOTAL).increment(1);
}

pub fn set_system_cpu(percent: f64) {
    gauge!(SYSTEM_CPU_USAGE_PERCENT).set(percent);
}

pub fn set_system_memory(kind: &'static str, bytes: u64) {
    gauge!(SYSTEM_MEMORY_USAGE_BYTES, "type" => kind).set(bytes as f64);
}

pub fn set_system_tasks(alive: usize, workers: usize) {
    gauge!(SYSTEM_TASKS_COUNT).set(alive as f64);
    gauge!(SYSTEM_RUNTIME_WORKERS).set(workers as f64);
}

pub fn set_system_uptime(uptime: Duration) {
    gauge!(SYSTEM_UPTIME_SECONDS).set(uptime.as_secs_f64());
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring an outbound call and tracking it as in flight.
pub struct ClientRequestTimer {
    start: Instant,
    service: String,
    method: String,
}

impl ClientRequestTimer {
    pub fn new(service: &str, method: &str) -> Self {
        set_client_in_flight(service, 1.0);
        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for ClientRequestTimer {
    fn drop(&mut self) {
        set_client_in_flight(&self.service, -1.0);
        histogram!(
            HTTP_CLIENT_REQUEST_DURATION_SECONDS,
            "service" => self.service.clone(),
            "method" => self.method.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// Lifecycle wrapper for the metrics backend.
pub struct MetricsManager {
    config: MetricsConfig,
    handle: OnceCell<PrometheusHandle>,
    state: StateCell,
}

impl MetricsManager {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            handle: OnceCell::new(),
            state: StateCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Prometheus text exposition, when the exporter is installed.
    pub fn render(&self) -> Option<String> {
        self.handle.get().map(|handle| handle.render())
    }
}

#[async_trait]
impl Component for MetricsManager {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        init_metrics();
        if self.config.enabled && self.handle.get().is_none() {
            match install_prometheus(&self.config) {
                Ok(handle) => {
                    let _ = self.handle.set(handle);
                }
                Err(e) => {
                    self.state.set(LifecycleState::Stopped);
                    return Err(RuntimeError::wrap("failed to install metrics exporter", e));
                }
            }
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
