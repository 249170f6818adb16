//! Sharded fixed-window rate limiter keyed by client IP.
//!
//! Clients are spread over [`SHARD_COUNT`] shards by an FNV-1a hash of their
//! address. Each shard owns a map guarded by its own lock; per-client counters
//! are atomics so the common path only takes a shard read lock.
//!
//! A client exceeding `requests_per_minute` inside one window is blocked for a
//! full minute. A background sweeper drops idle, non-blocked entries.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{extract::ConnectInfo, http::HeaderMap, http::Extensions};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::models::duration_format;

/// Number of shards; must stay a power of two.
pub const SHARD_COUNT: usize = 128;
const MAX_RETRY_ATTEMPTS: u32 = 3;
const BLOCK_DURATION: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_CUTOFF: Duration = Duration::from_secs(60 * 60);

/// Limiter parameters, read from `middlewares.rate_limit.params`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    /// Accepted for configuration compatibility; the fixed window does not use it.
    pub burst: u32,
    #[serde(with = "duration_format")]
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst: 20,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-client counters. All times are nanoseconds on the limiter clock.
#[derive(Debug)]
pub struct RateLimitEntry {
    counter: AtomicI64,
    window_start: AtomicI64,
    blocked: AtomicBool,
    blocked_until: AtomicI64,
    last_access: AtomicI64,
}

impl RateLimitEntry {
    fn new(now: i64) -> Self {
        Self {
            counter: AtomicI64::new(1),
            window_start: AtomicI64::new(now),
            blocked: AtomicBool::new(false),
            blocked_until: AtomicI64::new(0),
            last_access: AtomicI64::new(now),
        }
    }

    pub fn is_blocked_at(&self, now: i64) -> bool {
        self.blocked.load(Ordering::Acquire) && now < self.blocked_until.load(Ordering::Acquire)
    }

    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Shard {
    clients: RwLock<HashMap<String, Arc<RateLimitEntry>>>,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    shards: Box<[Shard]>,
    epoch: Instant,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::default()).collect();
        Self {
            settings,
            shards,
            epoch: Instant::now(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Current time on the limiter clock.
    pub fn now(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    pub fn check(&self, client_ip: &str) -> bool {
        self.check_at(client_ip, self.now())
    }

    /// Record one request of `client_ip` at `now` and report whether it is allowed.
    pub fn check_at(&self, client_ip: &str, now: i64) -> bool {
        let shard = self.shard(client_ip);

        let existing = shard
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_ip)
            .cloned();

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut clients = shard.clients.write().unwrap_or_else(PoisonError::into_inner);
                match clients.get(client_ip) {
                    Some(entry) => entry.clone(),
                    None => {
                        clients.insert(client_ip.to_string(), Arc::new(RateLimitEntry::new(now)));
                        return true;
                    }
                }
            }
        };

        self.check_entry(&entry, now)
    }

    fn check_entry(&self, entry: &RateLimitEntry, now: i64) -> bool {
        entry.last_access.store(now, Ordering::Release);

        if entry.blocked.load(Ordering::Acquire) {
            if now < entry.blocked_until.load(Ordering::Acquire) {
                return false;
            }
            entry.blocked.store(false, Ordering::Release);
            entry.counter.store(0, Ordering::Release);
            entry.window_start.store(now, Ordering::Release);
        }

        let window = self.settings.window.as_nanos() as i64;
        let window_start = entry.window_start.load(Ordering::Acquire);
        if now - window_start > window {
            if entry
                .window_start
                .compare_exchange(window_start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.counter.store(1, Ordering::Release);
                return true;
            }
            return self.check_with_retry(entry, now, 0);
        }

        let counter = entry.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if counter > i64::from(self.settings.requests_per_minute) {
            entry.blocked_until.store(
                now + BLOCK_DURATION.as_nanos() as i64,
                Ordering::Release,
            );
            entry.blocked.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn check_with_retry(&self, entry: &RateLimitEntry, now: i64, attempts: u32) -> bool {
        if attempts >= MAX_RETRY_ATTEMPTS {
            return false;
        }

        let window = self.settings.window.as_nanos() as i64;
        let window_start = entry.window_start.load(Ordering::Acquire);
        if now - window_start > window {
            if entry
                .window_start
                .compare_exchange(window_start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.counter.store(1, Ordering::Release);
                return true;
            }
            return self.check_with_retry(entry, now, attempts + 1);
        }

        let counter = entry.counter.fetch_add(1, Ordering::AcqRel) + 1;
        counter <= i64::from(self.settings.requests_per_minute)
    }

    pub fn entry(&self, client_ip: &str) -> Option<Arc<RateLimitEntry>> {
        self.shard(client_ip)
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_ip)
            .cloned()
    }

    pub fn tracked_clients(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.clients.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Drop non-blocked entries idle for longer than an hour. Returns the number removed.
    pub fn sweep_at(&self, now: i64) -> usize {
        let cutoff = now - IDLE_CUTOFF.as_nanos() as i64;
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut clients = shard.clients.write().unwrap_or_else(PoisonError::into_inner);
            clients.retain(|_, entry| {
                let keep = entry.last_access.load(Ordering::Acquire) >= cutoff
                    || entry.blocked.load(Ordering::Acquire);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }

    /// Spawn the periodic sweeper as a child of `parent`. No-op while one is running.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = parent.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_at(limiter.now());
                        if removed > 0 {
                            tracing::debug!("Rate limiter sweep removed {} idle clients", removed);
                        }
                    }
                }
            }
        });
        tracing::debug!("Rate limiter sweeper started");
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Stop the sweeper. Safe to call more than once.
    pub fn stop(&self) {
        let token = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(token) = token {
            token.cancel();
            tracing::info!("Rate limiter stopped");
        }
    }

    fn shard(&self, client_ip: &str) -> &Shard {
        let index = fnv1a(client_ip.as_bytes()) as usize & (SHARD_COUNT - 1);
        &self.shards[index]
    }
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// `X-Real-IP`, else the first `X-Forwarded-For` element, else the socket peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }

    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const SECOND: i64 = 1_000_000_000;

    fn limiter(rpm: u32) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            requests_per_minute: rpm,
            ..Default::default()
        })
    }

    #[test]
    fn test_limit_boundary() {
        let limiter = limiter(5);
        for i in 0..5 {
            assert!(limiter.check_at("1.2.3.4", i * SECOND), "request {i} denied");
        }
        assert!(!limiter.check_at("1.2.3.4", 5 * SECOND));
        assert!(limiter.entry("1.2.3.4").unwrap().is_blocked_at(6 * SECOND));
        // Other clients are unaffected
        assert!(limiter.check_at("5.6.7.8", 5 * SECOND));
    }

    #[test]
    fn test_block_lasts_one_minute() {
        let limiter = limiter(1);
        assert!(limiter.check_at("ip", 0));
        assert!(!limiter.check_at("ip", SECOND));
        assert!(!limiter.check_at("ip", 60 * SECOND));
        // Unblocked; the counter restarts from zero in a fresh window
        assert!(limiter.check_at("ip", 62 * SECOND));
        assert!(!limiter.entry("ip").unwrap().is_blocked_at(62 * SECOND));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(2);
        assert!(limiter.check_at("ip", 0));
        assert!(limiter.check_at("ip", SECOND));
        assert!(limiter.check_at("ip", 61 * SECOND));
        assert_eq!(limiter.entry("ip").unwrap().count(), 1);
    }

    #[test]
    fn test_sustained_rate_is_always_allowed() {
        let limiter = limiter(10);
        // 10 requests per minute over five minutes
        for i in 0..50 {
            assert!(limiter.check_at("ip", i * 6 * SECOND + i));
        }
    }

    #[test]
    fn test_sweep_keeps_blocked_and_recent_entries() {
        let limiter = limiter(1);
        limiter.check_at("idle", 0);
        limiter.check_at("blocked", 0);
        limiter.check_at("blocked", 1);
        let later = 2 * 60 * 60 * SECOND;
        limiter.check_at("recent", later);

        assert_eq!(limiter.sweep_at(later), 1);
        assert!(limiter.entry("idle").is_none());
        assert!(limiter.entry("blocked").is_some());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let limiter = limiter(1);
        limiter.stop();
        limiter.stop();
        assert!(!limiter.is_sweeping());
    }

    #[tokio::test]
    async fn test_sweeper_restarts_after_stop() {
        let limiter = Arc::new(limiter(1));
        let parent = CancellationToken::new();

        limiter.start(&parent);
        limiter.start(&parent);
        assert!(limiter.is_sweeping());

        limiter.stop();
        assert!(!limiter.is_sweeping());

        limiter.start(&parent);
        assert!(limiter.is_sweeping());

        parent.cancel();
        assert!(!limiter.is_sweeping());
        // A cancelled parent only ends the sweeper; a new parent revives it
        limiter.start(&CancellationToken::new());
        assert!(limiter.is_sweeping());
        limiter.stop();
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        assert_eq!(client_ip(&headers, &extensions), "unknown");

        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        assert_eq!(client_ip(&headers, &extensions), "10.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1, 2.2.2.2"));
        assert_eq!(client_ip(&headers, &extensions), "1.1.1.1");

        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, &extensions), "9.9.9.9");
    }

    #[test]
    fn test_fnv1a_known_vector() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }
}
