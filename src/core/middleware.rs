//! Middleware chain.
//!
//! Stages are registered with the [`MiddlewareManager`] before start. Start
//! validates the set (unique names, unique weights among default-enabled
//! stages, at most [`MAX_MIDDLEWARES`]), sorts it by ascending weight and
//! freezes it into a [`MiddlewareChain`]. A request walks the frozen slice through [`Next`],
//! which skips stages the matched route disables.
use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use axum::{extract::Request, response::Response};

use crate::{
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
        router::{RouteConfig, RouteHandler},
    },
    ports::component::Component,
};

pub const MAX_MIDDLEWARES: usize = 64;

/// One stage of the request pipeline.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Name routes use to disable or force this stage; compared case-insensitively.
    fn name(&self) -> &'static str;

    /// Position in the chain; lower runs first.
    fn weight(&self) -> i32;

    async fn handle(&self, req: Request, next: Next) -> Response;

    /// Called when the manager starts, for default-enabled stages only.
    fn start(&self) {}

    /// Release background resources when the manager stops. Called for every stage.
    fn stop(&self) {}
}

struct ChainEntry {
    stage: Arc<dyn Middleware>,
    /// Off-by-default stages only run on routes that force them
    default_enabled: bool,
}

/// The frozen, weight-ordered stage list.
pub struct MiddlewareChain {
    entries: Arc<[ChainEntry]>,
}

impl MiddlewareChain {
    fn compile(mut entries: Vec<ChainEntry>) -> RuntimeResult<Self> {
        if entries.len() > MAX_MIDDLEWARES {
            return Err(RuntimeError::MiddlewareInvalidType(format!(
                "too many middlewares: {} (max {MAX_MIDDLEWARES})",
                entries.len()
            )));
        }
        let mut names = HashSet::new();
        let mut weights = HashSet::new();
        for entry in &entries {
            let name = entry.stage.name().to_ascii_lowercase();
            if !names.insert(name) {
                return Err(RuntimeError::MiddlewareInvalidType(format!(
                    "duplicate middleware name: {}",
                    entry.stage.name()
                )));
            }
            if entry.default_enabled && !weights.insert(entry.stage.weight()) {
                return Err(RuntimeError::MiddlewareInvalidType(format!(
                    "duplicate middleware weight {} ({})",
                    entry.stage.weight(),
                    entry.stage.name()
                )));
            }
        }
        entries.sort_by(|a, b| {
            a.stage
                .weight()
                .cmp(&b.stage.weight())
                .then_with(|| a.stage.name().cmp(b.stage.name()))
        });
        Ok(Self {
            entries: entries.into(),
        })
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn dispatch(&self, req: Request, handler: RouteHandler, route: Arc<RouteConfig>) -> Response {
        Next {
            entries: self.entries.clone(),
            index: 0,
            handler,
            route,
        }
        .run(req)
        .await
    }
}

/// The rest of the chain after the current stage.
pub struct Next {
    entries: Arc<[ChainEntry]>,
    index: usize,
    handler: RouteHandler,
    route: Arc<RouteConfig>,
}

impl Next {
    /// Config of the route being served.
    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    pub async fn run(mut self, req: Request) -> Response {
        while let Some(entry) = self.entries.get(self.index) {
            self.index += 1;
            let name = entry.stage.name();
            if self.route.is_disabled(name) || (!entry.default_enabled && !self.route.forces(name)) {
                continue;
            }
            let stage = entry.stage.clone();
            return stage.handle(req, self).await;
        }
        (self.handler)(req).await
    }
}

pub struct MiddlewareManager {
    pending: RwLock<Vec<ChainEntry>>,
    chain: ArcSwapOption<MiddlewareChain>,
    state: StateCell,
}

impl Default for MiddlewareManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(Vec::new()),
            chain: ArcSwapOption::empty(),
            state: StateCell::new(),
        }
    }

    /// Add a stage. Stages registered with `default_enabled = false` only run
    /// on routes listing them in `middlewares`.
    pub fn register(&self, stage: Arc<dyn Middleware>, default_enabled: bool) -> RuntimeResult<()> {
        if self.state.get() != LifecycleState::Stopped {
            return Err(RuntimeError::MiddlewareInvalidType(format!(
                "cannot register '{}' after start",
                stage.name()
            )));
        }
        tracing::debug!(
            name = stage.name(),
            weight = stage.weight(),
            default_enabled,
            "Middleware registered"
        );
        self.pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ChainEntry {
                stage,
                default_enabled,
            });
        Ok(())
    }

    /// The compiled chain, present while running.
    pub fn chain(&self) -> Option<Arc<MiddlewareChain>> {
        self.chain.load_full()
    }
}

#[async_trait]
impl Component for MiddlewareManager {
    fn name(&self) -> &'static str {
        "middlewares"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        let entries = std::mem::take(
            &mut *self
                .pending
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        match MiddlewareChain::compile(entries) {
            Ok(chain) => {
                for entry in chain.entries.iter().filter(|e| e.default_enabled) {
                    entry.stage.start();
                }
                tracing::info!(chain = ?chain.names(), "Middleware chain compiled");
                self.chain.store(Some(Arc::new(chain)));
                self.state.set(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                self.state.set(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        if let Some(chain) = self.chain.swap(None) {
            for entry in chain.entries.iter() {
                entry.stage.stop();
            }
            // Keep the stages so a later start rebuilds the same chain.
            let entries = chain
                .entries
                .iter()
                .map(|e| ChainEntry {
                    stage: e.stage.clone(),
                    default_enabled: e.default_enabled,
                })
                .collect();
            *self
                .pending
                .write()
                .unwrap_or_else(PoisonError::into_inner) = entries;
        }
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}
