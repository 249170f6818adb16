//! Service lifecycle orchestration.
//!
//! A [`Service`] owns a [`ServiceContext`] and moves it through its
//! lifecycle. Start runs a serial init barrier, a parallel stage of
//! independent components and a serial serving stage, all under one global
//! start timeout. A failure stops whatever already started and reports the
//! failing component. Stop quiesces producers first, then ingress, then the
//! backing components and finally the configuration; stop errors are
//! collected and never prevent the service from reaching `Stopped`.
//!
//! Stop leaves the root token alive so the service can be started again;
//! background tasks parented on it are cancelled when the service is dropped.
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{models::ServiceConfig, provider::ConfigProvider},
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    ports::{component::Component, config_source::ConfigSource},
    utils::{GracefulShutdown, ShutdownHandle, ShutdownReason},
};

pub mod context;

pub use context::ServiceContext;

pub struct Service {
    context: ServiceContext,
    name: String,
    start_timeout: Duration,
    shutdown_timeout: Duration,
    shutdown: Arc<GracefulShutdown>,
    root: CancellationToken,
    state: Arc<StateCell>,
    stop_claimed: AtomicBool,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// Build a service from an in-memory configuration.
    pub fn new(config: ServiceConfig) -> RuntimeResult<Self> {
        Self::from_provider(ConfigProvider::from_config(config)?)
    }

    /// Load, validate and build from a configuration source.
    pub async fn load(source: &dyn ConfigSource) -> RuntimeResult<Self> {
        Self::from_provider(ConfigProvider::from_source(source).await?)
    }

    pub fn from_provider(provider: ConfigProvider) -> RuntimeResult<Self> {
        let config = provider.config();
        let shutdown = Arc::new(GracefulShutdown::new());
        let root = CancellationToken::new();
        let context = ServiceContext::build(provider, &root, &shutdown.token())?;
        Ok(Self {
            context,
            name: config.name.clone(),
            start_timeout: config.start_timeout,
            shutdown_timeout: config.shutdown_timeout,
            shutdown,
            root,
            state: Arc::new(StateCell::new()),
            stop_claimed: AtomicBool::new(false),
            signal_task: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Trigger used to stop [`Service::run`] from application code.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Address the HTTP server is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.context.http.local_addr()
    }

    pub async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        self.stop_claimed.store(false, Ordering::Release);
        tracing::info!(service = %self.name, "Starting service");

        let started = Mutex::new(Vec::new());
        let result = match tokio::time::timeout(self.start_timeout, self.start_stages(&started)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TimedOut(format!(
                "service start exceeded {:?}",
                self.start_timeout
            ))),
        };

        if let Err(e) = result {
            tracing::error!(service = %self.name, "Service failed to start: {}", e);
            let started = std::mem::take(&mut *started.lock().unwrap_or_else(PoisonError::into_inner));
            rollback(started).await;
            self.state.set(LifecycleState::Stopped);
            return Err(e);
        }

        self.install_signal_handler();
        self.state.set(LifecycleState::Running);
        tracing::info!(
            service = %self.name,
            address = ?self.local_addr(),
            "Service started"
        );
        Ok(())
    }

    async fn start_stages(&self, started: &Mutex<Vec<Arc<dyn Component>>>) -> RuntimeResult<()> {
        for component in self.context.init_stage() {
            start_one(&component).await?;
            record(started, component);
        }

        start_parallel(self.context.parallel_stage(), started).await?;

        for component in self.context.serving_stage() {
            start_one(&component).await?;
            record(started, component);
        }
        Ok(())
    }

    fn install_signal_handler(&self) {
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            shutdown.run_signal_handler().await;
            if state.transition(LifecycleState::Running, LifecycleState::Stopping) {
                tracing::info!(
                    reason = shutdown.reason().map(|r| r.as_str()).unwrap_or("requested"),
                    "Service stopping"
                );
            }
        });
        *self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop every running component. Returns the errors collected on the way;
    /// only calling it while the service is not running is an error.
    pub async fn stop(&self) -> RuntimeResult<Vec<RuntimeError>> {
        let claimed = self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
            || self.state.get() == LifecycleState::Stopping;
        if !claimed || self.stop_claimed.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::NotRunning);
        }
        tracing::info!(service = %self.name, "Stopping service");

        let mut errors = Vec::new();
        if tokio::time::timeout(self.shutdown_timeout, self.stop_stages(&mut errors))
            .await
            .is_err()
        {
            errors.push(RuntimeError::TimedOut(format!(
                "service stop exceeded {:?}",
                self.shutdown_timeout
            )));
        }

        if let Some(task) = self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for e in &errors {
            tracing::error!(service = %self.name, "Stop error: {}", e);
        }
        self.state.set(LifecycleState::Stopped);
        tracing::info!(service = %self.name, errors = errors.len(), "Service stopped");
        Ok(errors)
    }

    async fn stop_stages(&self, errors: &mut Vec<RuntimeError>) {
        errors.extend(stop_parallel(self.context.quiesce_stage()).await);
        for component in self.context.ingress_stage() {
            errors.extend(stop_one(&component).await);
        }
        errors.extend(stop_parallel(self.context.backing_stage()).await);
        for component in self.context.final_stage() {
            errors.extend(stop_one(&component).await);
        }
    }

    /// Start, wait for a signal or [`ShutdownHandle::shutdown`], then stop.
    pub async fn run(&self) -> RuntimeResult<Vec<RuntimeError>> {
        self.start().await?;
        let reason = self.shutdown.wait_for_shutdown_signal().await;
        tracing::info!(service = %self.name, reason = reason.as_str(), "Shutdown requested");
        self.stop().await
    }

    /// Request shutdown as if a signal had arrived.
    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger_shutdown(ShutdownReason::Requested);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn record(started: &Mutex<Vec<Arc<dyn Component>>>, component: Arc<dyn Component>) {
    started
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(component);
}

/// Start `stage` concurrently. Each component is recorded as soon as it is up
/// so a start timeout still rolls back the ones that made it.
async fn start_parallel(
    stage: Vec<Arc<dyn Component>>,
    started: &Mutex<Vec<Arc<dyn Component>>>,
) -> RuntimeResult<()> {
    let results = join_all(stage.into_iter().map(|component| async move {
        start_one(&component).await?;
        record(started, component);
        Ok::<_, RuntimeError>(())
    }))
    .await;
    match results.into_iter().find_map(Result::err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn start_one(component: &Arc<dyn Component>) -> RuntimeResult<()> {
    tracing::debug!(component = component.name(), "Starting component");
    component
        .start()
        .await
        .map_err(|e| RuntimeError::wrap(format!("failed to start {}", component.name()), e))
}

async fn stop_one(component: &Arc<dyn Component>) -> Option<RuntimeError> {
    if !component.is_running() {
        return None;
    }
    tracing::debug!(component = component.name(), "Stopping component");
    component
        .stop()
        .await
        .err()
        .map(|e| RuntimeError::wrap(format!("failed to stop {}", component.name()), e))
}

async fn stop_parallel(stage: Vec<Arc<dyn Component>>) -> Vec<RuntimeError> {
    join_all(stage.iter().map(stop_one))
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Stop what a failed start left running, newest first.
async fn rollback(started: Vec<Arc<dyn Component>>) {
    for component in started.into_iter().rev() {
        if let Some(e) = stop_one(&component).await {
            tracing::warn!("Rollback: {}", e);
        }
    }
}
