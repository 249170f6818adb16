//! Health registry: named checkers run in parallel into one report.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, future::BoxFuture};
use serde::Serialize;

use crate::{
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::component::Component,
};

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// What a checker reports; the registry fills in name, time and duration.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl CheckOutcome {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub type HealthChecker = Arc<dyn Fn() -> BoxFuture<'static, CheckOutcome> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub service: ServiceInfo,
    pub checks: BTreeMap<String, HealthCheck>,
    pub summary: HealthSummary,
}

pub struct HealthManager {
    service: ServiceInfo,
    checkers: RwLock<HashMap<String, HealthChecker>>,
    started_at: RwLock<Option<Instant>>,
    check_timeout: Duration,
    state: StateCell,
}

impl HealthManager {
    pub fn new(service: ServiceInfo) -> Self {
        Self {
            service,
            checkers: RwLock::new(HashMap::new()),
            started_at: RwLock::new(None),
            check_timeout: CHECK_TIMEOUT,
            state: StateCell::new(),
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Register or replace the checker called `name`.
    pub fn register_checker<F, Fut>(&self, name: impl Into<String>, checker: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CheckOutcome> + Send + 'static,
    {
        let checker: HealthChecker = Arc::new(move || checker().boxed());
        self.checkers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), checker);
    }

    pub fn checker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Run every checker in parallel and aggregate the results.
    pub async fn check(&self) -> RuntimeResult<HealthReport> {
        if !self.is_running() {
            return Err(RuntimeError::HealthIsNotRunning);
        }

        let snapshot: Vec<(String, HealthChecker)> = self
            .checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, checker)| (name.clone(), checker.clone()))
            .collect();

        let timeout = self.check_timeout;
        let results = futures_util::future::join_all(
            snapshot
                .into_iter()
                .map(|(name, checker)| run_check(name, checker, timeout)),
        )
        .await;

        let checks = results
            .into_iter()
            .map(|check| (check.name.clone(), check))
            .collect();
        Ok(self.build_report(checks))
    }

    fn build_report(&self, checks: BTreeMap<String, HealthCheck>) -> HealthReport {
        let mut summary = HealthSummary {
            total: checks.len(),
            ..Default::default()
        };
        for check in checks.values() {
            match check.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        let uptime_secs = self
            .started_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed().as_secs())
            .unwrap_or_default();

        HealthReport {
            status: aggregate(checks.values().map(|c| c.status)),
            timestamp: Utc::now(),
            uptime_secs,
            service: self.service.clone(),
            checks,
            summary,
        }
    }
}

/// Any Unhealthy dominates, then any Unknown, else Healthy.
pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Unknown => overall = HealthStatus::Unknown,
            HealthStatus::Healthy => {}
        }
    }
    overall
}

async fn run_check(name: String, checker: HealthChecker, timeout: Duration) -> HealthCheck {
    let start = Instant::now();
    // Spawned so a panicking checker surfaces as a JoinError.
    let task = tokio::spawn(checker());
    let outcome = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => {
            tracing::error!("Health check '{}' panicked: {}", name, join_error);
            CheckOutcome::unhealthy(format!("Health check panicked: {join_error}"))
        }
        Err(_) => {
            tracing::warn!("Health check '{}' timed out after {:?}", name, timeout);
            CheckOutcome::unhealthy("Health check timeout")
        }
    };

    HealthCheck {
        name,
        status: outcome.status,
        message: outcome.message,
        last_check: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
        details: outcome.details,
    }
}

#[async_trait]
impl Component for HealthManager {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        *self
            .started_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.state.set(LifecycleState::Running);
        tracing::info!("Health manager started");
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
