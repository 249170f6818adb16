use async_trait::async_trait;

use crate::core::{errors::RuntimeResult, lifecycle::LifecycleState};

/// A unit the service orchestrator starts and stops.
///
/// `start` on a running component returns `AlreadyRunning`; `stop` on a
/// component that is not running returns `NotRunning`.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Stable name used in logs and wrapped errors.
    fn name(&self) -> &'static str;

    async fn start(&self) -> RuntimeResult<()>;

    async fn stop(&self) -> RuntimeResult<()>;

    fn state(&self) -> LifecycleState;

    fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }
}
