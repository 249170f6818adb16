use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use once_cell::sync::OnceCell;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
    /// Requested programmatically through a [`ShutdownHandle`]
    Requested,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Interrupt => "SIGINT",
            ShutdownReason::Terminate => "SIGTERM",
            ShutdownReason::Quit => "SIGQUIT",
            ShutdownReason::Requested => "requested",
        }
    }
}

/// Owns the root cancellation token of a service and turns OS signals into
/// its cancellation.
pub struct GracefulShutdown {
    root: CancellationToken,
    shutdown_initiated: Arc<AtomicBool>,
    reason: Arc<OnceCell<ShutdownReason>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Use an existing token as the root.
    pub fn with_token(root: CancellationToken) -> Self {
        Self {
            root,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(OnceCell::new()),
        }
    }

    /// The root token; every long-running task derives a child from it.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            root: self.root.clone(),
            shutdown_initiated: self.shutdown_initiated.clone(),
            reason: self.reason.clone(),
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        self.handle().shutdown(reason);
    }

    /// Listen for SIGINT, SIGTERM and SIGQUIT until one arrives or the root
    /// token is canceled by other means. Returns the reason when a signal won.
    pub async fn run_signal_handler(&self) -> Option<ShutdownReason> {
        tracing::info!("Signal handler started. Listening for SIGINT, SIGTERM and SIGQUIT");

        let reason = tokio::select! {
            _ = self.root.cancelled() => None,
            _ = signal::ctrl_c() => Some(ShutdownReason::Interrupt),
            _ = wait_for(SignalKindName::Terminate) => Some(ShutdownReason::Terminate),
            _ = wait_for(SignalKindName::Quit) => Some(ShutdownReason::Quit),
        };

        if let Some(reason) = reason {
            tracing::info!("Received {}, initiating graceful shutdown...", reason.as_str());
            self.trigger_shutdown(reason);
        }
        reason
    }

    /// Wait until the root token is canceled.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.root.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable trigger for the root token.
#[derive(Clone)]
pub struct ShutdownHandle {
    root: CancellationToken,
    shutdown_initiated: Arc<AtomicBool>,
    reason: Arc<OnceCell<ShutdownReason>>,
}

impl ShutdownHandle {
    /// Cancel the root token. Only the first call records its reason.
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.reason.set(reason);
            tracing::info!("Shutdown triggered: {}", reason.as_str());
            self.root.cancel();
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {}", reason.as_str());
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }
}

enum SignalKindName {
    Terminate,
    Quit,
}

#[cfg(unix)]
async fn wait_for(kind: SignalKindName) {
    use tokio::signal::unix::{SignalKind, signal};
    let kind = match kind {
        SignalKindName::Terminate => SignalKind::terminate(),
        SignalKindName::Quit => SignalKind::quit(),
    };
    match signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register signal handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for(_kind: SignalKindName) {
    // Only Ctrl+C exists outside unix
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert!(!shutdown.token().is_cancelled());
        assert!(shutdown.reason().is_none());
    }

    #[tokio::test]
    async fn test_manual_trigger_cancels_children() {
        let shutdown = GracefulShutdown::new();
        let child = shutdown.token().child_token();

        shutdown.trigger_shutdown(ShutdownReason::Terminate);

        assert!(shutdown.is_shutdown_initiated());
        assert!(child.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::new();
        let handle = shutdown.handle();
        handle.shutdown(ShutdownReason::Requested);
        handle.shutdown(ShutdownReason::Quit);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn test_signal_handler_returns_when_token_canceled() {
        let shutdown = GracefulShutdown::new();
        let handle = shutdown.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.shutdown(ShutdownReason::Requested);
        });

        let result =
            tokio::time::timeout(Duration::from_secs(2), shutdown.run_signal_handler()).await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Requested
        );
    }
}
