//! Action messages, handler table and handler fan-out.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Envelope carried through the broker link and webhook deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub message_id: String,
}

impl ActionMessage {
    pub fn new(
        action: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
        message_id: String,
    ) -> Self {
        Self {
            action: action.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
            metadata: HashMap::new(),
            message_id,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Produces `{source}-{unix_secs}-{counter}` ids.
#[derive(Debug)]
pub struct MessageIdGenerator {
    source: String,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", self.source, Utc::now().timestamp(), n)
    }
}

pub type ActionHandler =
    Arc<dyn Fn(ActionMessage) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`ActionHandler`].
pub fn handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(ActionMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Action name to local subscribers. Shared by the dispatcher, the broker
/// link and the inbound webhook route.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Vec<ActionHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, action: &str, handler: ActionHandler) -> usize {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(action.to_string()).or_default();
        list.push(handler);
        list.len()
    }

    /// Drop every handler of `action`, returning how many were removed.
    pub fn remove(&self, action: &str) -> usize {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(action)
            .map(|list| list.len())
            .unwrap_or_default()
    }

    /// Snapshot of the handlers for `action`, taken under the read lock.
    pub fn snapshot(&self, action: &str) -> Vec<ActionHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(action)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, action: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(action)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        actions.sort();
        actions
    }
}

/// Outcome of one fan-out to local handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerReport {
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
    /// Handlers still running when the deadline or cancellation hit
    pub abandoned: usize,
}

impl HandlerReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.panicked == 0 && self.abandoned == 0
    }
}

/// Run every handler for `message.action` in parallel under one deadline.
///
/// Each handler is its own task, so a panic is reported instead of unwinding
/// into the caller. Handler errors are logged and never cancel their peers.
pub async fn run_handlers(
    table: &HandlerTable,
    message: ActionMessage,
    deadline: Duration,
    cancel: &CancellationToken,
) -> HandlerReport {
    let start = Instant::now();
    let handlers = table.snapshot(&message.action);
    let mut report = HandlerReport::default();
    if handlers.is_empty() {
        tracing::debug!(
            action = %message.action,
            message_id = %message.message_id,
            "No handlers found for action"
        );
        metrics::record_action_operation("handle", "no_handlers", &message.action, start.elapsed());
        return report;
    }

    let total = handlers.len();
    let mut tasks = JoinSet::new();
    for (index, handler) in handlers.into_iter().enumerate() {
        let message = message.clone();
        tasks.spawn(async move { (index, handler(message).await) });
    }

    let collect = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.succeeded += 1,
                Ok((index, Err(e))) => {
                    report.failed += 1;
                    tracing::error!(
                        action = %message.action,
                        message_id = %message.message_id,
                        handler_index = index,
                        "Action handler failed: {:#}",
                        e
                    );
                }
                Err(join_error) => {
                    report.panicked += 1;
                    tracing::error!(
                        action = %message.action,
                        message_id = %message.message_id,
                        "Action handler panicked: {}",
                        join_error
                    );
                }
            }
        }
    };

    let cancelled = tokio::select! {
        _ = tokio::time::timeout(deadline, collect) => false,
        _ = cancel.cancelled() => true,
    };
    let done = report.succeeded + report.failed + report.panicked;
    if done < total {
        report.abandoned = total - done;
        tracing::warn!(
            action = %message.action,
            abandoned = report.abandoned,
            cancelled,
            "Action handlers did not finish before the deadline"
        );
    }
    // Dropping the set aborts whatever is still running.
    drop(tasks);

    let result = if report.panicked > 0 {
        "panic"
    } else if report.is_clean() {
        "success"
    } else {
        "error"
    };
    metrics::record_action_operation("handle", result, &message.action, start.elapsed());
    report
}
