//! In-process cache engine.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::{CacheConfig, EvictionPolicy},
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
    },
    metrics,
    ports::{
        cache::{CacheError, CacheProvider},
        component::Component,
    },
};

struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
    dependencies: Vec<String>,
    /// Insertion order, for FIFO
    inserted: u64,
    /// Last access order, for LRU
    touched: u64,
    hits: u64,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    /// Dependency name to the keys stored against it
    dependents: HashMap<String, HashSet<String>>,
    clock: u64,
}

impl Store {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        for dep in &entry.dependencies {
            if let Some(keys) = self.dependents.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
        true
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let chosen = match policy {
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| e.inserted),
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| e.touched),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.hits, e.touched)),
        };
        chosen.map(|(key, _)| key.clone())
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Bounded in-memory [`CacheProvider`] with TTLs and dependency revisions.
pub struct MemoryCache {
    config: CacheConfig,
    store: Mutex<Store>,
    revisions: RwLock<HashMap<String, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    state: StateCell,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
            revisions: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            cancel: Mutex::new(None),
            state: StateCell::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses, evictions)` since creation.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }

    /// Drop expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.lock().purge_expired(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, "Expired cache entries removed");
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn miss(&self) -> Option<Bytes> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_miss();
        None
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let mut store = self.lock();
        let now = Instant::now();
        let expired = match store.entries.get(key) {
            None => return self.miss(),
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            store.remove(key);
            return self.miss();
        }
        let tick = store.tick();
        let entry = store.entries.get_mut(key)?;
        entry.touched = tick;
        entry.hits += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_hit();
        Some(entry.value.clone())
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        dependencies: &[String],
    ) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::KeyEmpty);
        }
        let mut store = self.lock();
        store.remove(key);
        if self.config.max_entries > 0 && store.entries.len() >= self.config.max_entries {
            if let Some(victim) = store.victim(self.config.eviction_policy) {
                store.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_eviction();
                tracing::debug!(key = %victim, policy = ?self.config.eviction_policy, "Cache entry evicted");
            }
        }

        let tick = store.tick();
        for dep in dependencies {
            store
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
        store.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
                dependencies: dependencies.to_vec(),
                inserted: tick,
                touched: tick,
                hits: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) {
        if self.lock().remove(key) {
            tracing::debug!(key, "Cache entry deleted");
        }
    }

    async fn invalidate(&self, dependencies: &[String]) {
        {
            let mut revisions = self
                .revisions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for dep in dependencies {
                *revisions.entry(dep.clone()).or_default() += 1;
            }
        }
        let mut store = self.lock();
        for dep in dependencies {
            let keys = store.dependents.remove(dep).unwrap_or_default();
            for key in &keys {
                store.remove(key);
            }
            tracing::debug!(dependency = %dep, invalidated = keys.len(), "Dependencies invalidated");
        }
    }

    fn revision(&self, dependency: &str) -> u64 {
        self.revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency)
            .copied()
            .unwrap_or_default()
    }

    fn set_revision(&self, dependency: &str, revision: u64) {
        self.revisions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dependency.to_string(), revision);
    }

    fn build_cache_key(
        &self,
        path: &str,
        dependencies: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> String {
        let mut key = String::with_capacity(path.len() + dependencies.len() * 20 + metadata.len() * 30);
        key.push_str(path);
        for dep in dependencies {
            key.push('|');
            key.push_str(dep);
            key.push('|');
            key.push_str(&self.revision(dep).to_string());
        }
        for (name, value) in metadata {
            key.push('|');
            key.push_str(name);
            key.push(':');
            key.push_str(value);
        }
        key
    }
}

/// Lifecycle wrapper running the periodic cleanup.
pub struct CacheComponent {
    cache: Arc<MemoryCache>,
    parent: CancellationToken,
}

impl CacheComponent {
    pub fn new(cache: Arc<MemoryCache>, parent: CancellationToken) -> Self {
        Self { cache, parent }
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }
}

#[async_trait]
impl Component for CacheComponent {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn start(&self) -> RuntimeResult<()> {
        let cache = &self.cache;
        if !cache
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        let token = self.parent.child_token();
        *cache.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        let interval = cache.config.cleanup_interval;
        if !interval.is_zero() {
            let cache = cache.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            cache.cleanup();
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }
        cache.state.set(LifecycleState::Running);
        tracing::info!(
            max_entries = cache.config.max_entries,
            policy = ?cache.config.eviction_policy,
            "Memory cache started"
        );
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        let cache = &self.cache;
        if !cache
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        if let Some(token) = cache.cancel.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        cache.state.set(LifecycleState::Stopped);
        let (hits, misses, evictions) = cache.stats();
        tracing::info!(hits, misses, evictions, "Memory cache stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.cache.state.get()
    }
}
