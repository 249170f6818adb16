//! Lifecycle state shared by every component.
//!
//! State lives in an `AtomicU8` and only moves through compare-and-swap
//! transitions, so two concurrent `start` calls can never both succeed.
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for a [`LifecycleState`].
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Stopped as u8),
        }
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns false when the current state differs.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store, used to land in a terminal state after a failure.
    pub fn set(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == LifecycleState::Running
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
