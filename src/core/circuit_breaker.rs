//! Per-service circuit breaker.
//!
//! State changes happen under one mutex; counters are atomics so stats can be
//! read without it. Every transition resets the counters it owns.
use std::{
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicI64, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::config::models::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
    Stopped,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
            BreakerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    /// Unix seconds of the last recorded failure, 0 when none
    pub last_fail: i64,
}

pub struct CircuitBreaker {
    service: String,
    enabled: bool,
    threshold: u32,
    recovery_timeout: Duration,
    half_open_quorum: u32,
    state: Mutex<BreakerState>,
    failures: AtomicU32,
    successes: AtomicU32,
    last_fail_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            enabled: config.enabled,
            threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            half_open_quorum: config.half_open_requests.max(1),
            state: Mutex::new(BreakerState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            last_fail_ms: AtomicI64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a call may go out now. An expired Open moves to HalfOpen here.
    pub fn can_execute(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let mut state = self.lock();
        match *state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Stopped => false,
            BreakerState::Open => {
                let elapsed = now_ms() - self.last_fail_ms.load(Ordering::Acquire);
                if elapsed > self.recovery_timeout.as_millis() as i64 {
                    *state = BreakerState::HalfOpen;
                    self.successes.store(0, Ordering::Release);
                    tracing::info!(service = %self.service, "Circuit breaker transitioned to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        match *state {
            BreakerState::Closed => self.failures.store(0, Ordering::Release),
            BreakerState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(
                    service = %self.service,
                    successes,
                    required = self.half_open_quorum,
                    "Success recorded in half-open state"
                );
                if successes >= self.half_open_quorum {
                    self.close(&mut state);
                }
            }
            BreakerState::Open => {
                tracing::warn!(service = %self.service, "Success recorded in open circuit breaker state");
            }
            BreakerState::Stopped => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        match *state {
            BreakerState::Stopped => {}
            BreakerState::Closed => {
                self.last_fail_ms.store(now_ms(), Ordering::Release);
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(
                    service = %self.service,
                    failures,
                    threshold = self.threshold,
                    "Failure recorded in closed state"
                );
                if failures >= self.threshold {
                    *state = BreakerState::Open;
                    self.successes.store(0, Ordering::Release);
                    tracing::warn!(
                        service = %self.service,
                        failures,
                        threshold = self.threshold,
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {
                self.last_fail_ms.store(now_ms(), Ordering::Release);
            }
            BreakerState::HalfOpen => {
                self.last_fail_ms.store(now_ms(), Ordering::Release);
                *state = BreakerState::Open;
                self.failures.store(1, Ordering::Release);
                self.successes.store(0, Ordering::Release);
                tracing::warn!(service = %self.service, "Circuit breaker reopened from half-open");
            }
        }
    }

    /// Force Closed unless the breaker was stopped.
    pub fn reset(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        if *state == BreakerState::Stopped {
            return;
        }
        let old = *state;
        self.close(&mut state);
        tracing::info!(
            service = %self.service,
            old_state = old.as_str(),
            "Circuit breaker manually reset"
        );
    }

    /// Deny everything from now on. Safe to call more than once.
    pub fn stop(&self) {
        let mut state = self.lock();
        if *state != BreakerState::Stopped {
            *state = BreakerState::Stopped;
            tracing::debug!(service = %self.service, "Circuit breaker stopped");
        }
    }

    /// Bring a stopped breaker back to Closed with cleared counters.
    pub fn restart(&self) {
        let mut state = self.lock();
        if *state == BreakerState::Stopped {
            self.close(&mut state);
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.lock()
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.lock();
        BreakerStats {
            state: *state,
            failures: self.failures.load(Ordering::Acquire),
            successes: self.successes.load(Ordering::Acquire),
            last_fail: self.last_fail_ms.load(Ordering::Acquire) / 1000,
        }
    }

    fn close(&self, state: &mut BreakerState) {
        *state = BreakerState::Closed;
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.last_fail_ms.store(0, Ordering::Release);
        tracing::info!(service = %self.service, "Circuit breaker closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration, quorum: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "users",
            &CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_requests: quorum,
            },
        )
    }

    #[test]
    fn test_threshold_exactly_reached_opens() {
        let cb = breaker(3, Duration::from_secs(60), 2);
        for _ in 0..3 {
            assert!(cb.can_execute());
            cb.record_failure();
        }
        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Open);
        assert!(stats.failures >= 3);
        assert!(stats.last_fail > 0);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_before_threshold_resets_failures() {
        let cb = breaker(3, Duration::from_secs(60), 2);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_recovery_and_quorum() {
        let cb = breaker(1, Duration::from_millis(30), 2);
        cb.record_failure();
        assert!(!cb.can_execute());

        std::thread::sleep(Duration::from_millis(50));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(
            cb.stats(),
            BreakerStats {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_fail: 0,
            }
        );
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(2, Duration::from_millis(10), 3);
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());
        cb.record_success();
        cb.record_failure();
        let stats = cb.stats();
        assert_eq!(stats.state, BreakerState::Open);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.successes, 0);
    }

    #[test]
    fn test_reset_and_stop() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.stop();
        cb.stop();
        assert!(!cb.can_execute());
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Stopped);
    }

    #[test]
    fn test_restart_after_stop() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        cb.record_failure();
        cb.restart();
        // Only a stopped breaker is touched
        assert_eq!(cb.state(), BreakerState::Open);

        cb.stop();
        cb.restart();
        assert_eq!(cb.stats().state, BreakerState::Closed);
        assert_eq!(cb.stats().failures, 0);
        assert_eq!(cb.stats().last_fail, 0);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_disabled_always_allows() {
        let cb = CircuitBreaker::new(
            "users",
            &CircuitBreakerConfig {
                enabled: false,
                ..Default::default()
            },
        );
        for _ in 0..10 {
            cb.record_failure();
        }
        assert!(cb.can_execute());
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
