//! Process gauges sampled on a fixed interval.
//!
//! The collector refreshes only the current process through `sysinfo`, reads
//! task counts from the tokio runtime handle and publishes everything through
//! the `system_*` gauges in [`crate::metrics`].
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    metrics,
    ports::component::Component,
};

/// One reading of the process gauges.
#[derive(Debug, Clone, Default)]
pub struct SystemSample {
    /// Percent of one core; may exceed 100 on multi-core hosts
    pub cpu_percent: f64,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub alive_tasks: usize,
    pub workers: usize,
    pub uptime: Duration,
}

struct Sampler {
    system: System,
    pid: Option<Pid>,
    born: Instant,
}

impl Sampler {
    fn new(born: Instant) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Process statistics unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            born,
        }
    }

    fn sample(&mut self) -> SystemSample {
        let mut sample = SystemSample {
            uptime: self.born.elapsed(),
            ..Default::default()
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runtime = handle.metrics();
            sample.alive_tasks = runtime.num_alive_tasks();
            sample.workers = runtime.num_workers();
        }
        if let Some(pid) = self.pid {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_cpu().with_memory(),
            );
            if let Some(process) = self.system.process(pid) {
                sample.cpu_percent = f64::from(process.cpu_usage());
                sample.resident_bytes = process.memory();
                sample.virtual_bytes = process.virtual_memory();
            }
        }
        sample
    }
}

fn publish(sample: &SystemSample) {
    metrics::set_system_cpu(sample.cpu_percent);
    metrics::set_system_memory("resident", sample.resident_bytes);
    metrics::set_system_memory("virtual", sample.virtual_bytes);
    metrics::set_system_tasks(sample.alive_tasks, sample.workers);
    metrics::set_system_uptime(sample.uptime);
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SystemMetricsCollector {
    interval: Duration,
    born: Instant,
    parent: CancellationToken,
    latest: Arc<Mutex<Option<SystemSample>>>,
    ticker: Mutex<Option<Ticker>>,
    state: StateCell,
}

impl SystemMetricsCollector {
    /// Uptime is measured from construction. Each start samples under a fresh
    /// child of `parent`.
    pub fn new(interval: Duration, parent: CancellationToken) -> Self {
        Self {
            interval,
            born: Instant::now(),
            parent,
            latest: Arc::new(Mutex::new(None)),
            ticker: Mutex::new(None),
            state: StateCell::new(),
        }
    }

    /// The most recent reading, once the first tick has run.
    pub fn latest(&self) -> Option<SystemSample> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Component for SystemMetricsCollector {
    fn name(&self) -> &'static str {
        "system_metrics"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        if self.interval.is_zero() {
            self.state.set(LifecycleState::Stopped);
            return Err(RuntimeError::ConfigInvalid(
                "metrics.system_interval must be positive".to_string(),
            ));
        }

        let token = self.parent.child_token();
        let mut sampler = Sampler::new(self.born);
        let latest = self.latest.clone();
        let period = self.interval;
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = sampler.sample();
                        publish(&sample);
                        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
                    }
                }
            }
        });
        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Ticker { token, handle });

        self.state.set(LifecycleState::Running);
        tracing::info!(interval = ?self.interval, "System metrics collection started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        let ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Ticker { token, handle }) = ticker {
            token.cancel();
            if let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!("System metrics task panicked: {}", e);
            }
        }
        self.state.set(LifecycleState::Stopped);
        tracing::info!("System metrics collection stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_sample(collector: &SystemMetricsCollector) -> SystemSample {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(sample) = collector.latest() {
                    return sample;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_samples_until_stopped_and_after_restart() {
        let collector = SystemMetricsCollector::new(Duration::from_millis(10), CancellationToken::new());
        collector.start().await.unwrap();
        assert!(matches!(collector.start().await, Err(RuntimeError::AlreadyRunning)));

        let sample = wait_for_sample(&collector).await;
        // The sampling task itself is alive
        assert!(sample.alive_tasks >= 1);
        assert!(sample.workers >= 1);
        #[cfg(target_os = "linux")]
        assert!(sample.resident_bytes > 0);

        collector.stop().await.unwrap();
        assert_eq!(collector.state(), LifecycleState::Stopped);
        let frozen = collector.latest().unwrap().uptime;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(collector.latest().unwrap().uptime, frozen);

        collector.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.latest().unwrap().uptime == frozen {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_parent_ends_sampling() {
        let parent = CancellationToken::new();
        let collector = SystemMetricsCollector::new(Duration::from_millis(10), parent.clone());
        collector.start().await.unwrap();
        wait_for_sample(&collector).await;
        parent.cancel();
        // Stop still completes once the task has exited on its own
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let collector = SystemMetricsCollector::new(Duration::ZERO, CancellationToken::new());
        assert!(matches!(collector.start().await, Err(RuntimeError::ConfigInvalid(_))));
        assert_eq!(collector.state(), LifecycleState::Stopped);
    }
}
