//! Cron scheduler.
//!
//! Every job gets its own ticker task that sleeps until the next occurrence of
//! its schedule and then launches one wrapped run. A run owns a child
//! cancellation token with the per-run deadline; a newer run of the same job
//! cancels the older one. Stop cancels every ticker and active run and drains
//! the task tracker.
//!
//! Lock order is always `jobs` then `active`.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use futures_util::{FutureExt, future::BoxFuture};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::models::CronConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    metrics,
    ports::component::Component,
};

/// Time a timed-out run gets to observe its cancelled token before it is aborted.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub type CronJob =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Snapshot of a registered job and its run statistics.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub id: u64,
    pub name: String,
    pub spec: String,
    pub added_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_duration: Duration,
    pub total_duration: Duration,
    pub avg_duration: Duration,
    pub run_count: u64,
    pub last_error: Option<String>,
}

struct JobSlot {
    entry: JobEntry,
    schedule: Cron,
    job: CronJob,
    ticker: Option<CancellationToken>,
}

struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
}

struct Inner {
    timezone: Tz,
    job_timeout: Duration,
    parent: CancellationToken,
    root: RwLock<CancellationToken>,
    jobs: RwLock<HashMap<String, JobSlot>>,
    active: RwLock<HashMap<String, ActiveRun>>,
    next_job_id: AtomicU64,
    next_run_id: AtomicU64,
    shutdown: AtomicBool,
    tracker: TaskTracker,
    state: StateCell,
}

pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl CronScheduler {
    pub fn new(config: &CronConfig, parent: CancellationToken) -> Self {
        let timezone = match config.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(e) => {
                tracing::warn!(
                    "Unknown cron timezone '{}' ({}), falling back to UTC",
                    config.timezone,
                    e
                );
                Tz::UTC
            }
        };

        Self {
            inner: Arc::new(Inner {
                timezone,
                job_timeout: config.job_timeout,
                root: RwLock::new(parent.child_token()),
                parent,
                jobs: RwLock::new(HashMap::new()),
                active: RwLock::new(HashMap::new()),
                next_job_id: AtomicU64::new(1),
                next_run_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                state: StateCell::new(),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.timezone
    }

    /// Register `job` under `name` with a 5-field or seconds-first 6-field expression.
    pub fn add_job<F, Fut>(&self, name: &str, spec: &str, job: F) -> RuntimeResult<u64>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(RuntimeError::CronJobNameEmpty);
        }
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RuntimeError::CronSchedulerStopped);
        }
        let schedule = parse_schedule(spec)?;
        let job: CronJob = Arc::new(move |token| job(token).boxed());

        let id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed);
        let running = self.inner.state.is_running();
        {
            let mut jobs = self.inner.write_jobs();
            if jobs.contains_key(name) {
                return Err(RuntimeError::CronJobExists(name.to_string()));
            }
            jobs.insert(
                name.to_string(),
                JobSlot {
                    entry: JobEntry {
                        id,
                        name: name.to_string(),
                        spec: spec.to_string(),
                        added_at: Utc::now(),
                        last_run: None,
                        next_run: None,
                        last_duration: Duration::ZERO,
                        total_duration: Duration::ZERO,
                        avg_duration: Duration::ZERO,
                        run_count: 0,
                        last_error: None,
                    },
                    schedule,
                    job,
                    ticker: None,
                },
            );
        }

        if running {
            self.inner.spawn_ticker(name);
        }
        tracing::info!(job = name, spec, "Cron job added");
        Ok(id)
    }

    /// Unregister a job, stopping its ticker and cancelling a run in progress.
    pub fn remove_job(&self, name: &str) -> RuntimeResult<()> {
        let mut jobs = self.inner.write_jobs();
        let slot = jobs
            .remove(name)
            .ok_or_else(|| RuntimeError::CronJobNotFound(name.to_string()))?;
        if let Some(ticker) = slot.ticker {
            ticker.cancel();
        }
        let mut active = self.inner.write_active();
        if let Some(run) = active.remove(name) {
            run.token.cancel();
        }
        metrics::set_cron_active_jobs(active.len());
        tracing::info!(job = name, "Cron job removed");
        Ok(())
    }

    pub fn job(&self, name: &str) -> Option<JobEntry> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|slot| slot.entry.clone())
    }

    pub fn list_jobs(&self) -> Vec<JobEntry> {
        let mut entries: Vec<JobEntry> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|slot| slot.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn active_runs(&self) -> usize {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run a job once outside its schedule, through the same wrapper.
    pub async fn run_now(&self, name: &str) -> RuntimeResult<()> {
        let inner = self.inner.clone();
        let name = name.to_string();
        self.inner
            .tracker
            .track_future(async move { inner.execute(&name).await })
            .await
    }
}

fn parse_schedule(spec: &str) -> RuntimeResult<Cron> {
    Cron::new(spec)
        .with_seconds_optional()
        .parse()
        .map_err(|e| RuntimeError::CronExpressionInvalid {
            spec: spec.to_string(),
            reason: e.to_string(),
        })
}

impl Inner {
    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, JobSlot>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ActiveRun>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn root(&self) -> CancellationToken {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn_ticker(self: &Arc<Self>, name: &str) {
        let ticker = self.root().child_token();
        let schedule = {
            let mut jobs = self.write_jobs();
            let Some(slot) = jobs.get_mut(name) else {
                return;
            };
            if let Some(previous) = slot.ticker.replace(ticker.clone()) {
                previous.cancel();
            }
            slot.schedule.clone()
        };

        let inner = self.clone();
        let name = name.to_string();
        self.tracker
            .spawn(async move { inner.tick_loop(name, schedule, ticker).await });
    }

    async fn tick_loop(self: Arc<Self>, name: String, schedule: Cron, ticker: CancellationToken) {
        loop {
            let now = Utc::now().with_timezone(&self.timezone);
            let next = match schedule.find_next_occurrence(&now, false) {
                Ok(next) => next.with_timezone(&Utc),
                Err(e) => {
                    tracing::warn!(job = %name, "Cron schedule has no next occurrence: {}", e);
                    return;
                }
            };
            if let Some(slot) = self.write_jobs().get_mut(&name) {
                slot.entry.next_run = Some(next);
            }

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = ticker.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let inner = self.clone();
            let job_name = name.clone();
            self.tracker.spawn(async move {
                if let Err(e) = inner.execute(&job_name).await {
                    tracing::debug!(job = %job_name, "Scheduled run ended with error: {}", e);
                }
            });
        }
    }

    async fn execute(&self, name: &str) -> RuntimeResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::debug!(job = name, "Skipping cron run during shutdown");
            return Err(RuntimeError::CronSchedulerStopped);
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root().child_token();
        let job = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            let slot = jobs
                .get(name)
                .ok_or_else(|| RuntimeError::CronJobNotFound(name.to_string()))?;
            let mut active = self.write_active();
            if let Some(previous) = active.insert(
                name.to_string(),
                ActiveRun {
                    run_id,
                    token: token.clone(),
                },
            ) {
                tracing::warn!(job = name, "Cancelling previous run still in progress");
                previous.token.cancel();
            }
            metrics::set_cron_active_jobs(active.len());
            slot.job.clone()
        };

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::debug!(job = name, run_id, "Cron job started");

        // Spawned so a panicking job surfaces as a JoinError.
        let mut handle = tokio::spawn(job(token.clone()));
        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RuntimeError::CronJobFailed(format!("{name}: {e:#}"))),
                Err(join_error) => Err(RuntimeError::CronJobFailed(format!(
                    "{name}: job panicked: {join_error}"
                ))),
            },
            _ = tokio::time::sleep(self.job_timeout) => {
                token.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    tracing::warn!(job = name, "Cron job ignored cancellation, aborting");
                    handle.abort();
                }
                Err(RuntimeError::CronJobTimeout(name.to_string()))
            }
            _ = token.cancelled() => {
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
                Err(RuntimeError::Canceled)
            }
        };
        let duration = start.elapsed();

        {
            let mut jobs = self.write_jobs();
            if let Some(slot) = jobs.get_mut(name) {
                let entry = &mut slot.entry;
                entry.last_run = Some(started_at);
                entry.last_duration = duration;
                entry.total_duration += duration;
                entry.run_count += 1;
                entry.avg_duration = average(entry.total_duration, entry.run_count);
                entry.last_error = outcome.as_ref().err().map(ToString::to_string);
            }
            let mut active = self.write_active();
            if active.get(name).is_some_and(|run| run.run_id == run_id) {
                active.remove(name);
            }
            metrics::set_cron_active_jobs(active.len());
        }

        let result = match &outcome {
            Ok(()) => "success",
            Err(RuntimeError::CronJobTimeout(_)) => "timeout",
            Err(RuntimeError::Canceled) => "canceled",
            Err(_) => "error",
        };
        metrics::record_cron_execution(name, result, duration);

        match &outcome {
            Ok(()) => tracing::info!(job = name, ?duration, "Cron job completed"),
            Err(e) => tracing::error!(job = name, ?duration, "Cron job failed: {}", e),
        }
        outcome
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[async_trait]
impl Component for CronScheduler {
    fn name(&self) -> &'static str {
        "cron"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .inner
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::CronIsRunning);
        }

        *self
            .inner
            .root
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.inner.parent.child_token();
        self.inner.shutdown.store(false, Ordering::Release);
        self.inner.tracker.reopen();

        let names: Vec<String> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in &names {
            self.inner.spawn_ticker(name);
        }

        self.inner.state.set(LifecycleState::Running);
        metrics::set_cron_scheduler_running(true);
        tracing::info!(
            jobs = names.len(),
            timezone = %self.inner.timezone,
            "Cron scheduler started"
        );
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .inner
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }

        self.inner.shutdown.store(true, Ordering::Release);
        {
            let mut jobs = self.inner.write_jobs();
            for slot in jobs.values_mut() {
                slot.ticker = None;
                slot.entry.next_run = None;
            }
            let mut active = self.inner.write_active();
            for (_, run) in active.drain() {
                run.token.cancel();
            }
        }
        self.inner.root().cancel();

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        metrics::set_cron_active_jobs(0);
        metrics::set_cron_scheduler_running(false);
        self.inner.state.set(LifecycleState::Stopped);
        tracing::info!("Cron scheduler stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn scheduler(job_timeout: Duration) -> CronScheduler {
        CronScheduler::new(
            &CronConfig {
                enabled: true,
                timezone: "Europe/Berlin".to_string(),
                job_timeout,
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_average_survives_large_run_counts() {
        assert_eq!(average(Duration::from_secs(3), 0), Duration::ZERO);
        assert_eq!(average(Duration::from_secs(3), 2), Duration::from_millis(1500));
        // Counts past u32::MAX must not wrap into a bogus divisor
        let count = u64::from(u32::MAX) + 2;
        let total = Duration::from_nanos(count * 10);
        assert_eq!(average(total, count), Duration::from_nanos(10));
    }

    #[test]
    fn test_add_job_validation() {
        let cron = scheduler(Duration::from_secs(60));
        assert!(matches!(
            cron.add_job("", "* * * * *", |_| async { Ok(()) }),
            Err(RuntimeError::CronJobNameEmpty)
        ));
        assert!(matches!(
            cron.add_job("bad", "not a cron line", |_| async { Ok(()) }),
            Err(RuntimeError::CronExpressionInvalid { .. })
        ));
        cron.add_job("cleanup", "0 */5 * * * *", |_| async { Ok(()) })
            .unwrap();
        assert!(matches!(
            cron.add_job("cleanup", "* * * * *", |_| async { Ok(()) }),
            Err(RuntimeError::CronJobExists(name)) if name == "cleanup"
        ));
        assert_eq!(cron.list_jobs().len(), 1);
        assert_eq!(cron.timezone(), Tz::Europe__Berlin);
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let cron = CronScheduler::new(
            &CronConfig {
                timezone: "Mars/Olympus".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
        );
        assert_eq!(cron.timezone(), Tz::UTC);
    }

    #[test]
    fn test_remove_unknown_job() {
        let cron = scheduler(Duration::from_secs(60));
        assert!(matches!(
            cron.remove_job("ghost"),
            Err(RuntimeError::CronJobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_records_stats() {
        let cron = scheduler(Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        cron.add_job("report", "0 0 * * *", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        cron.run_now("report").await.unwrap();
        cron.run_now("report").await.unwrap();

        let entry = cron.job("report").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(entry.run_count, 2);
        assert!(entry.last_run.is_some());
        assert!(entry.last_error.is_none());
        assert_eq!(cron.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_jobs() {
        let cron = scheduler(Duration::from_secs(60));
        cron.add_job("fails", "* * * * *", |_| async {
            Err(eyre::eyre!("disk full"))
        })
        .unwrap();
        cron.add_job("panics", "* * * * *", |_| async {
            let exploded = true;
            if exploded {
                panic!("job exploded");
            }
            Ok(())
        })
        .unwrap();

        let err = cron.run_now("fails").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CronJobFailed(ref msg) if msg.contains("disk full")));

        let err = cron.run_now("panics").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CronJobFailed(ref msg) if msg.contains("panicked")));
        assert_eq!(cron.job("panics").unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let cron = scheduler(Duration::from_millis(50));
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        cron.add_job("slow", "* * * * *", move |token| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let err = cron.run_now("slow").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CronJobTimeout(_)));
        assert!(observed.load(Ordering::SeqCst));
        assert!(
            cron.job("slow")
                .unwrap()
                .last_error
                .unwrap()
                .contains("timeout")
        );
    }

    #[tokio::test]
    async fn test_ticker_fires_every_second() {
        let cron = scheduler(Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        cron.add_job("tick", "* * * * * *", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        cron.start().await.unwrap();
        assert!(matches!(cron.start().await, Err(RuntimeError::CronIsRunning)));
        assert!(cron.job("tick").unwrap().next_run.is_some());

        tokio::time::sleep(Duration::from_millis(2200)).await;
        cron.stop().await.unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one run, saw {seen}");
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_stop_cancels_active_runs_and_rejects_new_jobs() {
        let cron = Arc::new(scheduler(Duration::from_secs(60)));
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        cron.add_job("long", "0 0 1 1 *", move |token| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        cron.start().await.unwrap();

        let runner = cron.clone();
        let run = tokio::spawn(async move { runner.run_now("long").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cron.active_runs(), 1);

        cron.stop().await.unwrap();
        let _ = run.await.unwrap();
        assert!(observed.load(Ordering::SeqCst));
        assert!(matches!(
            cron.add_job("late", "* * * * *", |_| async { Ok(()) }),
            Err(RuntimeError::CronSchedulerStopped)
        ));
    }
}
